//! Readiness polling, epoll on Linux and kqueue on the BSDs and macOS.
//!
//! The interface is the small common denominator the reactor needs: slots
//! are registered with read interest by a `usize` key, write interest is
//! toggled as send queues fill and drain, and `wait` blocks until the
//! kernel reports readiness.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Readiness: u8 {
        const READABLE = 1;
        const WRITABLE = 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub key: usize,
    pub readiness: Readiness,
}

#[cfg(target_os = "linux")]
pub(crate) use linux::Poller;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub(crate) struct Poller {
        epfd: OwnedFd,
    }

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            // SAFETY: plain descriptor creation.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd == -1 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: the descriptor was just created and is owned here.
            Ok(Self {
                epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            })
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: usize) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events,
                u64: key as u64,
            };

            // SAFETY: `event` is a valid epoll_event (null for EPOLL_CTL_DEL
            // is tolerated everywhere past Linux 2.6.9, but passing one is
            // portable to older kernels as well).
            let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }

        /// Register with read interest.
        pub(crate) fn add(&self, fd: RawFd, key: usize) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, key)
        }

        pub(crate) fn del(&self, fd: RawFd) {
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
        }

        /// Toggle write interest, keeping read interest on.
        pub(crate) fn set_write(&self, fd: RawFd, key: usize, enable: bool) -> io::Result<()> {
            let mut events = libc::EPOLLIN as u32;
            if enable {
                events |= libc::EPOLLOUT as u32;
            }

            self.ctl(libc::EPOLL_CTL_MOD, fd, events, key)
        }

        /// Block until at least one registered descriptor is ready.
        pub(crate) fn wait(&self, out: &mut Vec<PollEvent>, max: usize) -> io::Result<()> {
            let mut events: Vec<libc::epoll_event> = Vec::with_capacity(max);

            // SAFETY: the spare capacity is a valid out-buffer for up to
            // `max` events; `set_len` only covers what the kernel filled.
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    events.as_mut_ptr(),
                    max as libc::c_int,
                    -1,
                )
            };

            if n == -1 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: the kernel initialised the first `n` events.
            unsafe { events.set_len(n as usize) };

            out.clear();
            for event in &events {
                let mut readiness = Readiness::empty();

                if event.events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                    readiness |= Readiness::READABLE;
                }
                if event.events & libc::EPOLLOUT as u32 != 0 {
                    readiness |= Readiness::WRITABLE;
                }

                out.push(PollEvent {
                    key: event.u64 as usize,
                    readiness,
                });
            }

            Ok(())
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) use bsd::Poller;

#[cfg(all(unix, not(target_os = "linux")))]
mod bsd {
    use super::*;
    use core::ptr;

    pub(crate) struct Poller {
        kq: OwnedFd,
    }

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            // SAFETY: plain descriptor creation.
            let kq = unsafe { libc::kqueue() };
            if kq == -1 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: the descriptor was just created and is owned here.
            Ok(Self {
                kq: unsafe { OwnedFd::from_raw_fd(kq) },
            })
        }

        fn change(&self, fd: RawFd, filter: i16, flags: u16, key: usize) -> io::Result<()> {
            let change = libc::kevent {
                ident: fd as usize,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: key as *mut libc::c_void,
            };

            // SAFETY: one change, no event buffer, no timeout.
            let rc = unsafe {
                libc::kevent(self.kq.as_raw_fd(), &change, 1, ptr::null_mut(), 0, ptr::null())
            };

            if rc == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }

        pub(crate) fn add(&self, fd: RawFd, key: usize) -> io::Result<()> {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD, key)
        }

        pub(crate) fn del(&self, fd: RawFd) {
            let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0);
            let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0);
        }

        pub(crate) fn set_write(&self, fd: RawFd, key: usize, enable: bool) -> io::Result<()> {
            if enable {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD, key)
            } else {
                match self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, key) {
                    // Write interest may already be gone.
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                    other => other,
                }
            }
        }

        pub(crate) fn wait(&self, out: &mut Vec<PollEvent>, max: usize) -> io::Result<()> {
            let mut events: Vec<libc::kevent> = Vec::with_capacity(max);

            // SAFETY: the spare capacity is a valid out-buffer for up to
            // `max` events; `set_len` only covers what the kernel filled.
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    max as libc::c_int,
                    ptr::null(),
                )
            };

            if n == -1 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: the kernel initialised the first `n` events.
            unsafe { events.set_len(n as usize) };

            out.clear();
            for event in &events {
                let readiness = match event.filter {
                    libc::EVFILT_READ => Readiness::READABLE,
                    libc::EVFILT_WRITE => Readiness::WRITABLE,
                    _ => continue,
                };

                out.push(PollEvent {
                    key: event.udata as usize,
                    readiness,
                });
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::sys;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_becomes_readable() {
        let (rx, tx) = sys::pipe().unwrap();
        let poller = Poller::new().unwrap();

        poller.add(rx.as_raw_fd(), 7).unwrap();
        sys::write(tx.as_raw_fd(), b"x").unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events, 8).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, 7);
        assert!(events[0].readiness.contains(Readiness::READABLE));
    }

    #[test]
    fn write_interest_toggles() {
        let (rx, tx) = sys::pipe().unwrap();
        let poller = Poller::new().unwrap();

        poller.add(tx.as_raw_fd(), 1).unwrap();
        poller.set_write(tx.as_raw_fd(), 1, true).unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events, 8).unwrap();
        assert!(events.iter().any(|e| e.readiness.contains(Readiness::WRITABLE)));

        poller.set_write(tx.as_raw_fd(), 1, false).unwrap();
        drop(rx);
    }
}
