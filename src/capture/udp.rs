//! Live UDP receive path.
//!
//! Each subscribed port gets its own non-blocking dual-stack socket,
//! registered with the reactor for read readiness. On readiness the whole
//! backlog is drained with single `recvmmsg` calls into the shared arena;
//! the kernel also hands back a nanosecond receive timestamp per datagram
//! through `SCM_TIMESTAMPNS` ancillary data.
//!
//! Thread-hostile: every method, including dispatch, must run on the
//! thread that constructed the receiver.

use crate::capture::arena::PacketArena;
use crate::capture::{PacketHandler, PacketStatus, PacketTimestamp, ReceiverConfig, SharedHandler};
use crate::error::{Error, Result};
use crate::reactor::{interest, Reactor, SourceRecord, UdpSource};
use crate::telemetry::ReceiverStats;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Space for one `cmsghdr` carrying a `timespec`, with slack for header
/// padding differences across architectures.
const CMSG_CAPACITY: usize = 64;

#[repr(C, align(8))]
struct CmsgBuffer([u8; CMSG_CAPACITY]);

/// Batched-read state shared with the reactor's dispatch records: the
/// slot arena plus the pre-wired scatter-gather and message headers.
///
/// The iovec/address/control vectors are sized once in the constructor
/// and never resized afterwards; the message headers hold raw pointers
/// into them, which stay valid because a Vec's heap buffer does not move
/// when the Vec itself does.
pub(crate) struct RxEngine {
    batch_size: usize,
    arena: PacketArena,
    msgs: Vec<libc::mmsghdr>,
    // Referenced from `msgs` via raw pointers only.
    #[allow(dead_code)]
    iovecs: Vec<libc::iovec>,
    #[allow(dead_code)]
    addrs: Vec<libc::sockaddr_storage>,
    #[allow(dead_code)]
    cmsg_bufs: Vec<CmsgBuffer>,
    owner: ThreadId,
    stats: Rc<ReceiverStats>,
}

impl RxEngine {
    fn new(config: ReceiverConfig, stats: Rc<ReceiverStats>) -> Result<Self> {
        let arena = PacketArena::new(config.batch_size, config.buffer_size)?;

        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(config.batch_size);
        let mut addrs: Vec<libc::sockaddr_storage> = Vec::with_capacity(config.batch_size);
        let mut cmsg_bufs: Vec<CmsgBuffer> = Vec::with_capacity(config.batch_size);
        for i in 0..config.batch_size {
            iovecs.push(libc::iovec {
                iov_base: arena.slot_ptr(i) as *mut libc::c_void,
                iov_len: config.buffer_size,
            });
            addrs.push(unsafe { mem::zeroed() });
            cmsg_bufs.push(CmsgBuffer([0; CMSG_CAPACITY]));
        }

        let mut msgs: Vec<libc::mmsghdr> = Vec::with_capacity(config.batch_size);
        for i in 0..config.batch_size {
            let mut msg: libc::mmsghdr = unsafe { mem::zeroed() };
            msg.msg_hdr.msg_name = &mut addrs[i] as *mut _ as *mut libc::c_void;
            msg.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_hdr.msg_iov = &mut iovecs[i];
            msg.msg_hdr.msg_iovlen = 1;
            msg.msg_hdr.msg_control = cmsg_bufs[i].0.as_mut_ptr() as *mut libc::c_void;
            msg.msg_hdr.msg_controllen = CMSG_CAPACITY;
            msgs.push(msg);
        }

        Ok(Self {
            batch_size: config.batch_size,
            arena,
            msgs,
            iovecs,
            addrs,
            cmsg_bufs,
            owner: thread::current().id(),
            stats,
        })
    }

    /// Drains up to one batch from a ready socket and dispatches each
    /// datagram. Called by the reactor when the descriptor is readable.
    pub(crate) fn read_batch(&mut self, fd: RawFd, handler: &SharedHandler) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "UdpReceiver dispatched on wrong thread"
        );

        // The kernel overwrites these lengths per message; without the
        // reset, later batches would walk zero-length address and control
        // regions.
        for msg in &mut self.msgs {
            msg.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_hdr.msg_controllen = CMSG_CAPACITY;
        }

        let received = unsafe {
            libc::recvmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                self.batch_size as libc::c_uint,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
            )
        };
        if received < 0 {
            // EAGAIN after a spurious wakeup, or a transient error; either
            // way this cycle simply delivers nothing.
            trace!(fd, "recvmmsg: {}", io::Error::last_os_error());
            return;
        }

        self.stats.rx_batches.inc();

        for k in 0..received as usize {
            let flags = self.msgs[k].msg_hdr.msg_flags;
            let status = if flags & libc::MSG_TRUNC != 0 {
                self.stats.rx_truncated.inc();
                PacketStatus::TRUNCATED
            } else {
                PacketStatus::OK
            };

            let ts = self.timestamp_of(k);

            let len = self.msgs[k].msg_len as usize;
            if len == 0 {
                continue;
            }

            let payload = self.arena.slot(k, len);
            self.stats.rx_packets.inc();
            self.stats.rx_bytes.add(payload.len() as u64);
            (handler.borrow_mut())(payload, status, ts);
        }
    }

    /// Scans the ancillary data of message `k` for the kernel receive
    /// timestamp. `{0, 0}` when the control message is absent.
    fn timestamp_of(&self, k: usize) -> PacketTimestamp {
        let hdr = &self.msgs[k].msg_hdr as *const libc::msghdr as *mut libc::msghdr;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_TIMESTAMPNS
                {
                    let ts: libc::timespec =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                    return PacketTimestamp {
                        sec: ts.tv_sec as i64,
                        nsec: ts.tv_nsec as i64,
                    };
                }
                cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
            }
        }
        PacketTimestamp::default()
    }
}

pub struct UdpReceiver {
    reactor: Rc<Reactor>,
    engine: Rc<RefCell<RxEngine>>,
    ports: RefCell<BTreeMap<u16, OwnedFd>>,
    config: ReceiverConfig,
    owner: ThreadId,
    stats: Rc<ReceiverStats>,
}

impl UdpReceiver {
    pub fn new(reactor: &Rc<Reactor>, config: ReceiverConfig) -> Result<Self> {
        let stats = Rc::new(ReceiverStats::default());
        let engine = RxEngine::new(config, stats.clone())?;
        Ok(Self {
            reactor: reactor.clone(),
            engine: Rc::new(RefCell::new(engine)),
            ports: RefCell::new(BTreeMap::new()),
            config,
            owner: thread::current().id(),
            stats,
        })
    }

    /// Opens a wildcard-bound dual-stack socket on `port` and registers
    /// it for read readiness. Port 0 asks the OS for a free port; the
    /// actually bound port is returned either way and is the handle for
    /// `unsubscribe`.
    pub fn subscribe(&self, port: u16, handler: PacketHandler) -> Result<u16> {
        self.check_thread();

        let mut ports = self.ports.borrow_mut();
        if self.config.max_fds > 0 && ports.len() >= self.config.max_fds {
            return Err(Error::ResourceExhausted {
                limit: self.config.max_fds,
            });
        }
        if ports.contains_key(&port) {
            return Err(Error::AddrInUse { port });
        }

        let (socket, is_v6) = open_udp_socket()?;
        let raw = socket.as_raw_fd();

        set_sockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        set_sockopt(raw, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        // Ask for kernel nanosecond receive timestamps in ancillary data.
        set_sockopt(raw, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1)?;

        if is_v6 {
            // Accept IPv4 datagrams on the same socket; kernels that
            // force v6-only just lose the v4 side.
            let _ = set_sockopt(raw, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);
            bind_wildcard_v6(raw, port)?;
        } else {
            bind_wildcard_v4(raw, port)?;
        }

        let local_port = bound_port(raw)?;

        let shared: SharedHandler = Rc::new(RefCell::new(handler));
        self.reactor.add_source(
            raw,
            interest::READ,
            SourceRecord::Udp(UdpSource {
                fd: raw,
                engine: self.engine.clone(),
                handler: shared,
            }),
        )?;

        // Socket ownership moves into the map only after registration
        // succeeded; on the error paths above, OwnedFd closes it.
        ports.insert(local_port, socket);
        Ok(local_port)
    }

    /// Removes the port's socket from the reactor and closes it.
    pub fn unsubscribe(&self, port: u16) -> Result<()> {
        self.check_thread();
        let socket = self.ports.borrow_mut().remove(&port).ok_or(Error::NotFound)?;
        let res = self.reactor.remove_source(socket.as_raw_fd());
        drop(socket);
        res
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "UdpReceiver accessed from wrong thread"
        );
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        // Deregister every socket so the reactor can never dispatch into
        // a dropped engine; the OwnedFds then close themselves.
        for (_, socket) in self.ports.borrow().iter() {
            let _ = self.reactor.remove_source(socket.as_raw_fd());
        }
    }
}

/// IPv6 first for dual-stack operation, IPv4 when the kernel has IPv6
/// disabled outright.
fn open_udp_socket() -> Result<(OwnedFd, bool)> {
    let flags = libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let fd = unsafe { libc::socket(libc::AF_INET6, flags, 0) };
    if fd >= 0 {
        return Ok((unsafe { OwnedFd::from_raw_fd(fd) }, true));
    }
    if io::Error::last_os_error().raw_os_error() != Some(libc::EAFNOSUPPORT) {
        return Err(Error::last_os());
    }
    let fd = unsafe { libc::socket(libc::AF_INET, flags, 0) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, false))
}

fn set_sockopt(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

fn bind_wildcard_v6(fd: RawFd, port: u16) -> Result<()> {
    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    addr.sin6_port = port.to_be();
    // in6addr_any is all zeroes, which mem::zeroed already gave us.
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

fn bind_wildcard_v4(fd: RawFd, port: u16) -> Result<()> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

/// Resolves the actually bound port, which differs from the requested
/// one when subscribing with port 0.
fn bound_port(fd: RawFd) -> Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    let port_be = match storage.ss_family as libc::c_int {
        libc::AF_INET6 => {
            let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            addr.sin6_port
        }
        libc::AF_INET => {
            let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            addr.sin_port
        }
        _ => return Err(Error::InvalidArg("unexpected socket address family")),
    };
    Ok(u16::from_be(port_be))
}
