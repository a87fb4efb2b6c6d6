//! TCP echo server on fibers
//!
//! One fiber per connection, hooked blocking I/O over the epoll
//! reactor. The accept loop and every connection handler are plain
//! straight-line code.
//!
//! Usage:
//!     cargo run --release -p filament-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900

use std::os::unix::io::RawFd;
use std::time::Duration;

use filament::{hook, IoManager};

const BACKLOG: libc::c_int = 1024;

fn main() -> std::io::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9900);
    let workers: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    filament::kprint::init();
    let iom = IoManager::new(workers, false, "echo")?;
    iom.schedule(move || serve(port));

    println!("echo server on 127.0.0.1:{} ({} workers), ctrl-c to quit", port, workers);
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn serve(port: u16) {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).expect("socket");

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        eprintln!("bind failed: {}", std::io::Error::last_os_error());
        return;
    }
    if unsafe { libc::listen(fd, BACKLOG) } != 0 {
        eprintln!("listen failed: {}", std::io::Error::last_os_error());
        return;
    }

    loop {
        match hook::accept(fd) {
            Ok(client) => {
                let iom = IoManager::get_this().expect("accept loop off the reactor");
                iom.schedule(move || handle(client));
            }
            Err(e) => {
                eprintln!("accept failed: {}", e);
                break;
            }
        }
    }
}

fn handle(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        match hook::read(fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if write_all(fd, &buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = hook::close(fd);
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = hook::write(fd, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}
