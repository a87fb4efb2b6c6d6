//! File descriptor bookkeeping for the hook layer
//!
//! A lazily created [`FdCtx`] records what the hook needs to know about
//! an fd: whether it is a socket, whether the *user* asked for
//! non-blocking mode, and the per-direction timeouts set through
//! `setsockopt`. Sockets are silently switched to `O_NONBLOCK` at the
//! system level; the hook re-creates blocking semantics on top of the
//! reactor.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::config::NO_TIMEOUT;

/// Which direction a timeout applies to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// Map a `setsockopt` option name, if it is one of the two timeout
    /// options.
    pub fn from_sockopt(optname: libc::c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// Hook-visible state of one fd.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        let valid = ret == 0;
        let is_socket = valid && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            // The hook needs every socket non-blocking underneath,
            // whatever the user thinks the fd's mode is.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(!valid),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_sys_nonblock(&self, on: bool) {
        self.sys_nonblock.store(on, Ordering::SeqCst);
    }

    /// The mode the application asked for. The hook only yields on
    /// EAGAIN when the user expects a blocking fd.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    /// Timeout in ms for the given direction, or `None`.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.timeout_cell(kind).load(Ordering::SeqCst);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        self.timeout_cell(kind).store(ms, Ordering::SeqCst);
    }

    fn timeout_cell(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }
}

/// Process-wide table of [`FdCtx`] entries, indexed by fd.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn instance() -> &'static FdManager {
        static INSTANCE: OnceLock<FdManager> = OnceLock::new();
        INSTANCE.get_or_init(|| FdManager {
            fds: RwLock::new(Vec::new()),
        })
    }

    /// Fetch the context for `fd`, creating it when `auto_create` is
    /// set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read().unwrap();
            match fds.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        let mut fds = self.fds.write().unwrap();
        if idx >= fds.len() {
            let new_len = std::cmp::max(idx + 1, idx * 3 / 2);
            fds.resize(new_len, None);
        }
        if let Some(ctx) = &fds[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fds[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`. Called by the hooked `close`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if (fd as usize) < fds.len() {
            fds[fd as usize] = None;
        }
    }
}
