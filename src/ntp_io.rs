//! Packet I/O.
//!
//! Owns the NTP server/client socket. Received datagrams are stamped
//! from the kernel control message where the kernel provides one
//! (SO_TIMESTAMPNS), falling back to the scheduler's last
//! descriptor-ready time. Packets from registered source addresses go to
//! their state machines; client-mode requests from anyone else are
//! answered from the current reference state.

use crate::clock::{LocalClock, Ns, NS_PER_SEC};
use crate::ntp_source::PacketSender;
use crate::packet::{self, NtpPacket, NtpTimestamp};
use crate::persist::Logs;
use crate::reference::{Reference, ServerView};
use crate::registry::SourceRegistry;
use crate::scheduler::Scheduler;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{setsockopt, sockopt};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io::ErrorKind;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

pub struct NtpIo {
    socket: UdpSocket,
    sched: Scheduler,
    clock: Rc<RefCell<LocalClock>>,
    registry: Option<Rc<RefCell<SourceRegistry>>>,
    reference: Option<Rc<RefCell<Reference>>>,
    logs: Option<Rc<RefCell<Logs>>>,
    self_ref: Weak<RefCell<NtpIo>>,
}

impl NtpIo {
    pub fn new(
        sched: Scheduler,
        clock: Rc<RefCell<LocalClock>>,
        bind: IpAddr,
        port: u16,
    ) -> Result<Rc<RefCell<NtpIo>>> {
        let socket = open_socket(bind, port)?;
        info!("listening on {}:{}", bind, port);
        let io = Rc::new(RefCell::new(NtpIo {
            socket,
            sched,
            clock,
            registry: None,
            reference: None,
            logs: None,
            self_ref: Weak::new(),
        }));
        io.borrow_mut().self_ref = Rc::downgrade(&io);
        Ok(io)
    }

    /// Late wiring: the registry and reference hold the sender (this
    /// object) themselves.
    pub fn connect(
        &mut self,
        registry: Rc<RefCell<SourceRegistry>>,
        reference: Rc<RefCell<Reference>>,
        logs: Option<Rc<RefCell<Logs>>>,
    ) {
        self.registry = Some(registry);
        self.reference = Some(reference);
        self.logs = logs;
    }

    /// Register the socket with the scheduler.
    pub fn start(&mut self) -> Result<()> {
        let me = self.self_ref.clone();
        let fd = self.socket.as_raw_fd();
        self.sched.add_fd_handler(
            fd,
            Box::new(move |_fd| {
                if let Some(io) = me.upgrade() {
                    io.borrow_mut().on_readable();
                }
            }),
        )
    }

    pub fn stop(&mut self) {
        let _ = self.sched.remove_fd_handler(self.socket.as_raw_fd());
    }

    fn on_readable(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match recv_with_timestamp(self.socket.as_raw_fd(), &mut buf) {
                Ok(Some((len, from, kernel_raw))) => {
                    let (rx_cooked, rx_err) = match kernel_raw {
                        Some(raw) => self.clock.borrow().cooked_from_raw(raw),
                        None => self
                            .sched
                            .last_ready_time()
                            .unwrap_or_else(|| self.clock.borrow().cooked_now()),
                    };
                    let data = buf[..len].to_vec();
                    self.handle_datagram(from, &data, rx_cooked, rx_err);
                }
                Ok(None) => break,
                Err(e) => {
                    // Transient network errors become statistical loss.
                    debug!("receive error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], rx_cooked: Ns, rx_err: f64) {
        let pkt = match NtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("{}: dropping malformed packet: {}", from, e);
                return;
            }
        };

        if let Some(registry) = &self.registry {
            match registry
                .borrow_mut()
                .dispatch(from, &pkt, data, rx_cooked, rx_err)
            {
                Some(true) => {
                    if let (Some(logs), Some(source)) =
                        (&self.logs, registry.borrow().lookup(&from))
                    {
                        let stats = source.borrow().stats();
                        let stats = stats.borrow();
                        let mut logs = logs.borrow_mut();
                        logs.log_statistics(rx_cooked, &from, &stats);
                        if let Some((t, offset, delay)) = stats.newest_sample() {
                            logs.log_measurement(t, &from, offset, delay);
                        }
                    }
                    // A fresh sample: run a selection round.
                    if let Some(reference) = &self.reference {
                        reference.borrow_mut().update_from_registry(&registry.borrow());
                    }
                    return;
                }
                Some(false) => return,
                None => {}
            }
        }

        // Not one of our sources: act as a server.
        if pkt.mode == packet::MODE_CLIENT || pkt.mode == packet::MODE_SYMMETRIC_ACTIVE {
            let view = match &self.reference {
                Some(reference) => reference.borrow().server_view(),
                None => return,
            };
            let (tx_cooked, _) = self.clock.borrow().cooked_now();
            let reply = build_server_reply(&pkt, &view, rx_cooked, tx_cooked);
            if let Err(e) = self.socket.send_to(&reply.encode(), from) {
                debug!("{}: failed to send reply: {}", from, e);
            }
        }
    }
}

impl PacketSender for NtpIo {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket
            .send_to(data, to)
            .map(|_| ())
            .with_context(|| format!("send to {}", to))
    }
}

/// Fill in a server response for `req` from the current reference state.
pub fn build_server_reply(
    req: &NtpPacket,
    view: &ServerView,
    rx_cooked: Ns,
    tx_cooked: Ns,
) -> NtpPacket {
    let mode = if req.mode == packet::MODE_SYMMETRIC_ACTIVE {
        packet::MODE_SYMMETRIC_PASSIVE
    } else {
        packet::MODE_SERVER
    };
    NtpPacket {
        leap: view.leap,
        version: packet::VERSION,
        mode,
        stratum: view.stratum,
        poll: req.poll,
        precision: crate::clock::PRECISION_LOG2,
        root_delay: view.root_delay,
        root_dispersion: view.root_dispersion,
        reference_id: view.reference_id,
        reference_ts: NtpTimestamp::from_unix_ns(view.reference_time),
        origin_ts: req.transmit_ts,
        receive_ts: NtpTimestamp::from_unix_ns(rx_cooked),
        transmit_ts: NtpTimestamp::from_unix_ns(tx_cooked),
        mac_key_id: None,
    }
}

fn open_socket(bind: IpAddr, port: u16) -> Result<UdpSocket> {
    let domain = match bind {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&SocketAddr::new(bind, port).into())
        .with_context(|| format!("binding {}:{}", bind, port))?;
    let udp_socket: UdpSocket = socket.into();

    // Kernel receive timestamps where available.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    match setsockopt(&udp_socket, sockopt::ReceiveTimestampns, &true) {
        Ok(_) => info!("kernel timestamping (SO_TIMESTAMPNS) enabled"),
        Err(e) => warn!("failed to enable kernel timestamping: {}", e),
    }

    Ok(udp_socket)
}

/// recvmsg with the SCM_TIMESTAMPNS control message. Returns
/// Ok(None) once the socket is drained.
fn recv_with_timestamp(
    fd: RawFd,
    buf: &mut [u8],
) -> Result<Option<(usize, SocketAddr, Option<Ns>)>> {
    let mut addr_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr_storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(anyhow!("recvmsg failed: {}", err));
    }

    let from = sockaddr_to_std(&addr_storage).ok_or_else(|| anyhow!("unknown address family"))?;

    let mut kernel_ts = None;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPNS {
                let ts = &*(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                kernel_ts = Some(ts.tv_sec as Ns * NS_PER_SEC + ts.tv_nsec as Ns);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some((n as usize, from, kernel_ts)))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}
