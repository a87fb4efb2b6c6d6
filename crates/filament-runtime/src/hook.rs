//! Blocking-call interception
//!
//! Wrappers around the socket syscalls that keep their blocking
//! semantics for the caller while never blocking the worker thread.
//! Under the hood every socket is `O_NONBLOCK`; on `EAGAIN` the calling
//! fiber arms a readiness event (plus a condition timer when the fd has
//! an `SO_RCVTIMEO`/`SO_SNDTIMEO` timeout), suspends, and retries once
//! the reactor wakes it. A timeout surfaces as `ETIMEDOUT`.
//!
//! The hook is per-thread and enabled automatically on scheduler
//! workers. On a thread with the hook disabled every wrapper degrades
//! to the plain syscall.

use std::cell::Cell;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};

use filament_core::ktrace;

use crate::config::{self, NO_TIMEOUT};
use crate::fdmanager::{FdManager, TimeoutKind};
use crate::fiber::Fiber;
use crate::iomanager::{EventSet, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked wrappers on this thread reroute blocking waits
/// through the reactor.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

/// Shared between a parked operation and its watchdog timer. A nonzero
/// value is the errno the operation must fail with.
#[derive(Default)]
struct OpState {
    cancelled: AtomicI32,
}

fn check(n: libc::ssize_t) -> io::Result<usize> {
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn check_unit(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Shared retry loop for every hooked I/O call.
///
/// Runs `f` directly when the hook or fd doesn't apply. Otherwise loops:
/// retry on EINTR, park on EAGAIN until `event` fires or the fd's
/// timeout expires, then call `f` again.
fn do_io(
    fd: RawFd,
    name: &str,
    event: EventSet,
    timeout_kind: TimeoutKind,
    mut f: impl FnMut() -> libc::ssize_t,
) -> io::Result<usize> {
    if !is_hook_enabled() {
        return check(f());
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return check(f());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return check(f());
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    let state = Arc::new(OpState::default());

    loop {
        let mut n = f();
        while n == -1 && Errno::last() == Errno::EINTR {
            n = f();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if Errno::last() != Errno::EAGAIN {
            return Err(io::Error::last_os_error());
        }

        let iom = IoManager::get_this().expect("hooked I/O outside a reactor thread");
        ktrace!("{} on fd {} would block, parking fiber", name, fd);

        let timer = timeout_ms.map(|ms| {
            let weak = Arc::downgrade(&state);
            let iom2 = iom.clone();
            let guard = ctx.clone();
            iom.add_condition_timer(
                ms,
                move || {
                    let Some(st) = weak.upgrade() else { return };
                    if st.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) == 0 {
                        iom2.cancel_event(fd, event);
                    }
                },
                move || !guard.is_closed(),
                false,
            )
        });

        if let Err(err) = iom.add_event(fd, event, None) {
            if let Some(t) = &timer {
                t.cancel();
            }
            return Err(err);
        }
        Fiber::yield_to_suspend();

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = state.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
        // Woken by readiness: retry.
    }
}

/// Suspend the current fiber for `ms` milliseconds without holding a
/// worker thread. Falls back to `thread::sleep` off the runtime.
pub fn sleep_ms(ms: u64) {
    if !is_hook_enabled() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let Some(iom) = IoManager::get_this() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::get_this();
    let iom2 = iom.clone();
    iom.add_timer(
        ms,
        move || {
            iom2.schedule_fiber(fiber.clone(), None);
        },
        false,
    );
    Fiber::yield_to_suspend();
}

pub fn sleep(dur: Duration) {
    sleep_ms(dur.as_millis() as u64);
}

pub fn usleep(us: u64) {
    sleep_ms(us / 1000);
}

/// Create a socket and register it with the fd manager so later hooked
/// calls know it.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if is_hook_enabled() {
        FdManager::instance().get(fd, true);
    }
    Ok(fd)
}

/// `connect` with the global default timeout
/// ([`config::connect_timeout_ms`]).
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let ms = config::connect_timeout_ms();
    let timeout = (ms != NO_TIMEOUT).then_some(ms);
    connect_with_timeout(fd, addr, timeout)
}

/// Non-blocking connect: kick off the handshake, park on writability,
/// then read the outcome from `SO_ERROR`.
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: Option<u64>) -> io::Result<()> {
    let ss = SockaddrStorage::from(*addr);
    let raw_connect = || unsafe { libc::connect(fd, ss.as_ptr(), ss.len()) };

    if !is_hook_enabled() {
        return check_unit(raw_connect());
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return check_unit(raw_connect());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return check_unit(raw_connect());
    }

    let mut n = raw_connect();
    while n == -1 && Errno::last() == Errno::EINTR {
        n = raw_connect();
    }
    if n == 0 {
        return Ok(());
    }
    if Errno::last() != Errno::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let iom = IoManager::get_this().expect("hooked connect outside a reactor thread");
    let state = Arc::new(OpState::default());
    let timer = timeout_ms.filter(|ms| *ms != NO_TIMEOUT).map(|ms| {
        let weak = Arc::downgrade(&state);
        let iom2 = iom.clone();
        iom.add_timer(
            ms,
            move || {
                let Some(st) = weak.upgrade() else { return };
                if st.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) == 0 {
                    iom2.cancel_event(fd, EventSet::WRITE);
                }
            },
            false,
        )
    });

    if let Err(err) = iom.add_event(fd, EventSet::WRITE, None) {
        if let Some(t) = &timer {
            t.cancel();
        }
        return Err(err);
    }
    Fiber::yield_to_suspend();

    if let Some(t) = &timer {
        t.cancel();
    }
    let cancelled = state.cancelled.load(Ordering::SeqCst);
    if cancelled != 0 {
        return Err(io::Error::from_raw_os_error(cancelled));
    }

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Accept a connection, registering the new fd with the fd manager.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    let client = n as RawFd;
    if is_hook_enabled() {
        FdManager::instance().get(client, true);
    }
    Ok(client)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", EventSet::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
    do_io(fd, "readv", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    do_io(fd, "writev", EventSet::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recv", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "send", EventSet::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, "recvfrom", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    })?;
    Ok((n, sockaddr_to_std(&storage)))
}

pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", EventSet::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", EventSet::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, addr: &SocketAddr) -> io::Result<usize> {
    let ss = SockaddrStorage::from(*addr);
    do_io(fd, "sendto", EventSet::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            ss.as_ptr(),
            ss.len(),
        )
    })
}

/// Close an fd, firing anything parked on it and forgetting its
/// context.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_hook_enabled() {
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            ctx.mark_closed();
            if let Some(iom) = IoManager::get_this() {
                iom.cancel_all(fd);
            }
            FdManager::instance().del(fd);
        }
    }
    check_unit(unsafe { libc::close(fd) })
}

/// `fcntl(F_SETFL)` that keeps the user's idea of `O_NONBLOCK` separate
/// from the actual fd mode: a hooked socket stays non-blocking at the
/// system level no matter what the caller sets.
pub fn fcntl_setfl(fd: RawFd, mut flags: libc::c_int) -> io::Result<()> {
    if let Some(ctx) = FdManager::instance().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
        }
    }
    check_unit(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })
}

/// `fcntl(F_GETFL)` reporting the user's view of `O_NONBLOCK`.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(ctx) = FdManager::instance().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            return Ok(if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            });
        }
    }
    Ok(flags)
}

/// `ioctl(FIONBIO)`. For a hooked socket only the user-visible flag is
/// toggled; the fd itself stays non-blocking.
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    if let Some(ctx) = FdManager::instance().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            ctx.set_user_nonblock(on);
            return Ok(());
        }
    }
    let mut val: libc::c_int = on as libc::c_int;
    check_unit(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut val) })
}

/// `setsockopt(SO_RCVTIMEO/SO_SNDTIMEO)`: record the timeout for the
/// hook and pass it through to the kernel.
pub fn set_socket_timeout(fd: RawFd, kind: TimeoutKind, ms: u64) -> io::Result<()> {
    if let Some(ctx) = FdManager::instance().get(fd, false) {
        ctx.set_timeout(kind, ms);
    }
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    check_unit(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_hook_disabled_by_default_off_runtime() {
        assert!(!is_hook_enabled());
    }

    #[test]
    fn test_hooked_sleeps_overlap() {
        let iom = IoManager::new(4, false, "hook-sleep").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        for _ in 0..100 {
            let c = count.clone();
            let tx = tx.clone();
            iom.schedule(move || {
                sleep_ms(10);
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                    let _ = tx.send(());
                }
            });
        }
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let elapsed = start.elapsed();
        iom.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
        // 100 serial sleeps would take a second; parked fibers share
        // the workers.
        assert!(elapsed < Duration::from_secs(1), "sleeps ran serially: {:?}", elapsed);
    }

    #[test]
    fn test_hooked_tcp_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let iom = IoManager::new(2, false, "hook-echo").unwrap();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            connect(fd, &addr).unwrap();
            assert_eq!(write(fd, b"hello").unwrap(), 5);
            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < 5 {
                got += read(fd, &mut buf[got..]).unwrap();
            }
            close(fd).unwrap();
            let _ = tx.send(buf.to_vec());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hello");
        iom.stop();
        server.join().unwrap();
    }

    /// Loopback listener whose accept queue is already full: the
    /// kernel drops further SYNs, so connects to it hang without any
    /// packet leaving the machine. Returns the address and every fd
    /// that must stay open for the queue to stay full.
    fn saturated_listener() -> (SocketAddr, Vec<RawFd>) {
        let srv = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(srv >= 0);
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::bind(srv, &sin as *const _ as *const libc::sockaddr, len) };
        assert_eq!(rc, 0);
        assert_eq!(unsafe { libc::listen(srv, 0) }, 0);
        let mut out_len = len;
        let rc = unsafe {
            libc::getsockname(srv, &mut sin as *mut _ as *mut libc::sockaddr, &mut out_len)
        };
        assert_eq!(rc, 0);
        let addr: SocketAddr = format!("127.0.0.1:{}", u16::from_be(sin.sin_port))
            .parse()
            .unwrap();

        let mut fds = vec![srv];
        for _ in 0..4 {
            let fd = unsafe {
                libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0)
            };
            assert!(fd >= 0);
            unsafe { libc::connect(fd, &sin as *const _ as *const libc::sockaddr, len) };
            fds.push(fd);
        }
        // Let the queued handshakes settle before anyone else tries.
        std::thread::sleep(Duration::from_millis(50));
        (addr, fds)
    }

    #[test]
    fn test_connect_timeout_does_not_block_worker() {
        let (addr, held) = saturated_listener();

        let iom = IoManager::new(1, false, "hook-connect").unwrap();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            let start = Instant::now();
            let res = connect_with_timeout(fd, &addr, Some(200));
            let _ = close(fd);
            let _ = tx.send((res.unwrap_err().raw_os_error(), start.elapsed()));
        });

        // The single worker must stay responsive while the connect is
        // parked.
        let (ptx, prx) = mpsc::channel();
        iom.schedule(move || {
            let _ = ptx.send(());
        });
        prx.recv_timeout(Duration::from_secs(2)).unwrap();

        let (errno, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(errno, Some(libc::ETIMEDOUT));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(3));
        iom.stop();
        for fd in held {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn test_recv_timeout_surfaces_etimedout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // Accept and keep the socket open without sending anything.
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(1));
            drop(stream);
        });

        let iom = IoManager::new(1, false, "hook-rcvto").unwrap();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            connect(fd, &addr).unwrap();
            set_socket_timeout(fd, TimeoutKind::Recv, 100).unwrap();
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let err = read(fd, &mut buf).unwrap_err();
            let _ = close(fd);
            let _ = tx.send((err.raw_os_error(), start.elapsed()));
        });
        let (errno, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(errno, Some(libc::ETIMEDOUT));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        iom.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_user_nonblock_bypasses_parking() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let iom = IoManager::new(1, false, "hook-nonblock").unwrap();
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            connect(fd, &addr).unwrap();
            fcntl_setfl(fd, libc::O_NONBLOCK).unwrap();
            assert_ne!(fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK, 0);
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let err = read(fd, &mut buf).unwrap_err();
            let _ = close(fd);
            let _ = tx.send((err.kind(), start.elapsed()));
        });
        let (kind, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(kind, io::ErrorKind::WouldBlock);
        // No parking: the error comes back immediately.
        assert!(elapsed < Duration::from_millis(200));
        iom.stop();
        server.join().unwrap();
    }
}
