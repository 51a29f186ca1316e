//! The descriptor: an owned OS socket handle plus its transport tag.
//!
//! A descriptor owns its handle for the descriptor's entire lifetime.
//! Closing is idempotent and releases the handle back to the OS. All
//! operations report failure through [`Error`] values; transient
//! conditions (`WOULD_BLOCK`, `INTERRUPTED`) are returned to the caller
//! for the engine to absorb.
//!
//! # Safety
//!
//! This module uses unsafe code in three contained places: adopting a
//! raw handle, viewing a byte buffer as an uninitialized receive
//! buffer, and issuing the handful of socket options `socket2` does
//! not expose. Invariants are enforced here so the rest of the system
//! stays safe.

#![allow(unsafe_code)]

use std::io::IoSlice;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::fs::FileExt;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::endpoint::{Endpoint, LocalEndpoint};
use crate::error::{Error, ErrorKind, Result};
use crate::notification::Notification;
#[cfg(target_os = "linux")]
use crate::notification::{Timestamp, TimestampKind, ZeroCopy};
use crate::operation::{SendPayload, ShutdownDirection};
use crate::option::{Linger, SocketOption, SocketOptionKind, TcpCongestionControl};
use crate::transport::{Transport, TransportFamily};

/// The raw OS handle type for sockets.
#[cfg(unix)]
pub type Handle = RawFd;

static ANONYMOUS_LOCAL_NAME: AtomicU64 = AtomicU64::new(0);

/// An owned OS socket handle and its transport tag.
#[derive(Debug)]
pub struct Descriptor {
    socket: Option<Socket>,
    transport: Transport,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Descriptor {
    /// Create a closed descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            socket: None,
            transport: Transport::Undefined,
        }
    }

    /// Open a socket of the specified `transport`. Fails with `ALREADY`
    /// if this descriptor already owns a handle.
    pub fn open(&mut self, transport: Transport) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::new(ErrorKind::Already));
        }
        let (domain, kind, protocol) = match transport {
            Transport::TcpIpv4 => (Domain::IPV4, Type::STREAM, Some(Protocol::TCP)),
            Transport::TcpIpv6 => (Domain::IPV6, Type::STREAM, Some(Protocol::TCP)),
            Transport::UdpIpv4 => (Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)),
            Transport::UdpIpv6 => (Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)),
            #[cfg(unix)]
            Transport::LocalStream => (Domain::UNIX, Type::STREAM, None),
            #[cfg(unix)]
            Transport::LocalDatagram => (Domain::UNIX, Type::DGRAM, None),
            #[cfg(not(unix))]
            Transport::LocalStream | Transport::LocalDatagram => {
                return Err(Error::new(ErrorKind::NotImplemented));
            }
            Transport::Undefined => return Err(Error::new(ErrorKind::Invalid)),
        };
        let socket = Socket::new(domain, kind, protocol)?;
        self.socket = Some(socket);
        self.transport = transport;
        tracing::trace!(%transport, "socket opened");
        Ok(())
    }

    /// Take ownership of the specified raw `handle`. Fails with
    /// `ALREADY` if this descriptor already owns a handle.
    #[cfg(unix)]
    pub fn acquire(&mut self, handle: Handle, transport: Transport) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::new(ErrorKind::Already));
        }
        // SAFETY: the caller transfers ownership of a valid open handle.
        self.socket = Some(unsafe { Socket::from_raw_fd(handle) });
        self.transport = transport;
        Ok(())
    }

    /// Give up ownership of the handle without closing it.
    #[cfg(unix)]
    pub fn release(&mut self) -> Result<Handle> {
        let socket = self.socket.take().ok_or(Error::new(ErrorKind::Invalid))?;
        self.transport = Transport::Undefined;
        Ok(socket.into_raw_fd())
    }

    /// Close the handle. Closing a closed descriptor is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            tracing::trace!(transport = %self.transport, "socket closed");
        }
        self.transport = Transport::Undefined;
        Ok(())
    }

    /// True while this descriptor owns a handle.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// The transport this descriptor was opened with.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// The raw OS handle.
    #[cfg(unix)]
    pub fn handle(&self) -> Result<Handle> {
        Ok(self.socket()?.as_raw_fd())
    }

    fn socket(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(Error::new(ErrorKind::Invalid))
    }

    /// Bind the socket to the specified `endpoint`.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let socket = self.socket()?;
        if reuse_address && !self.transport.is_local() {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&endpoint_to_sockaddr(endpoint)?)?;
        Ok(())
    }

    /// Bind the socket to any suitable address for its transport.
    pub fn bind_any(&self, reuse_address: bool) -> Result<()> {
        let endpoint = match self.transport.family() {
            TransportFamily::Ipv4 => {
                Endpoint::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            }
            TransportFamily::Ipv6 => {
                Endpoint::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
            }
            TransportFamily::Local => Endpoint::Local(LocalEndpoint::Path(anonymous_local_path())),
            TransportFamily::Undefined => return Err(Error::new(ErrorKind::Invalid)),
        };
        self.bind(&endpoint, reuse_address)
    }

    /// The endpoint this socket is bound to.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        Ok(sockaddr_to_endpoint(&self.socket()?.local_addr()?))
    }

    /// The endpoint of the connected peer.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        Ok(sockaddr_to_endpoint(&self.socket()?.peer_addr()?))
    }

    /// Put the socket into blocking or non-blocking mode.
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.socket()?.set_nonblocking(!blocking)?;
        Ok(())
    }

    /// The socket's pending error, cleared by this call.
    pub fn get_last_error(&self) -> Result<Option<Error>> {
        Ok(self.socket()?.take_error()?.map(Error::from))
    }

    /// Initiate a connection to the specified `endpoint`.
    ///
    /// In non-blocking mode an in-progress connection is reported as
    /// `WOULD_BLOCK`; completion is observed through writability and
    /// [`Self::get_last_error`].
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.socket()?.connect(&endpoint_to_sockaddr(endpoint)?)?;
        Ok(())
    }

    /// Shut down one or both directions of a connected socket.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let how = match direction {
            ShutdownDirection::Send => std::net::Shutdown::Write,
            ShutdownDirection::Receive => std::net::Shutdown::Read,
            ShutdownDirection::Both => std::net::Shutdown::Both,
        };
        self.socket()?.shutdown(how)?;
        Ok(())
    }

    /// Send payload bytes starting at `offset`, returning how many were
    /// handed to the OS. Partial transfers are normal, not errors.
    pub fn send(&self, payload: &SendPayload, offset: usize) -> Result<usize> {
        let socket = self.socket()?;
        match payload {
            SendPayload::Bytes(bytes) => {
                let rest = &bytes[offset.min(bytes.len())..];
                Ok(socket.send(rest)?)
            }
            SendPayload::Slices(slices) => {
                let mut skip = offset;
                let mut views: Vec<IoSlice<'_>> = Vec::with_capacity(slices.len());
                for slice in slices {
                    if skip >= slice.len() {
                        skip -= slice.len();
                        continue;
                    }
                    views.push(IoSlice::new(&slice[skip..]));
                    skip = 0;
                }
                if views.is_empty() {
                    return Ok(0);
                }
                Ok(socket.send_vectored(&views)?)
            }
            #[cfg(unix)]
            SendPayload::File(range) => {
                let remaining = (range.len as usize).saturating_sub(offset);
                if remaining == 0 {
                    return Ok(0);
                }
                let mut chunk = vec![0u8; remaining.min(64 * 1024)];
                let read = range
                    .file
                    .read_at(&mut chunk, range.offset + offset as u64)?;
                if read == 0 {
                    return Err(Error::new(ErrorKind::Eof));
                }
                Ok(socket.send(&chunk[..read])?)
            }
            #[cfg(not(unix))]
            SendPayload::File(_) => Err(Error::new(ErrorKind::NotImplemented)),
        }
    }

    /// Send a datagram to the specified `endpoint`.
    pub fn send_to(&self, payload: &SendPayload, endpoint: &Endpoint) -> Result<usize> {
        let socket = self.socket()?;
        let addr = endpoint_to_sockaddr(endpoint)?;
        match payload {
            SendPayload::Bytes(bytes) => Ok(socket.send_to(bytes, &addr)?),
            SendPayload::Slices(slices) => {
                let mut flat = Vec::with_capacity(payload.len());
                for slice in slices {
                    flat.extend_from_slice(slice);
                }
                Ok(socket.send_to(&flat, &addr)?)
            }
            SendPayload::File(_) => Err(Error::new(ErrorKind::NotImplemented)),
        }
    }

    /// Receive bytes into `buf`, returning how many arrived. Zero on a
    /// stream socket means the peer shut down its send direction.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket()?.recv(uninit_view(buf))?)
    }

    /// Receive a datagram into `buf`, returning its length and origin.
    pub fn receive_from(&self, buf: &mut [u8]) -> Result<(usize, Endpoint)> {
        let (len, addr) = self.socket()?.recv_from(uninit_view(buf))?;
        Ok((len, sockaddr_to_endpoint(&addr)))
    }

    /// Start listening with the specified `backlog`.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        self.socket()?.listen(backlog as i32)?;
        Ok(())
    }

    /// Accept a pending connection as a new owned descriptor.
    pub fn accept(&self) -> Result<(Descriptor, Endpoint)> {
        let (socket, addr) = self.socket()?.accept()?;
        let accepted = Descriptor {
            socket: Some(socket),
            transport: self.transport,
        };
        Ok((accepted, sockaddr_to_endpoint(&addr)))
    }

    /// Remove the filesystem name of a bound local socket.
    pub fn unlink(&self) -> Result<()> {
        if !self.transport.is_local() {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let addr = self.socket()?.local_addr()?;
        if let Some(path) = addr.as_pathname() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Set a single socket option.
    pub fn set_option(&self, option: &SocketOption) -> Result<()> {
        let socket = self.socket()?;
        match option {
            SocketOption::ReuseAddress(value) => socket.set_reuse_address(*value)?,
            #[cfg(unix)]
            SocketOption::ReusePort(value) => socket.set_reuse_port(*value)?,
            #[cfg(not(unix))]
            SocketOption::ReusePort(_) => return Err(Error::new(ErrorKind::NotImplemented)),
            SocketOption::KeepAlive(value) => socket.set_keepalive(*value)?,
            SocketOption::NoDelay(value) => socket.set_nodelay(*value)?,
            SocketOption::Linger(linger) => {
                let value = linger.enabled.then_some(linger.duration);
                socket.set_linger(value)?;
            }
            SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(*size)?,
            SocketOption::ReceiveBufferSize(size) => socket.set_recv_buffer_size(*size)?,
            #[cfg(unix)]
            SocketOption::SendLowWatermark(size) => {
                self.set_option_int(libc::SOL_SOCKET, libc::SO_SNDLOWAT, *size as libc::c_int)?;
            }
            #[cfg(unix)]
            SocketOption::ReceiveLowWatermark(size) => {
                self.set_option_int(libc::SOL_SOCKET, libc::SO_RCVLOWAT, *size as libc::c_int)?;
            }
            SocketOption::Broadcast(value) => socket.set_broadcast(*value)?,
            #[cfg(unix)]
            SocketOption::BypassRouting(value) => {
                self.set_option_int(
                    libc::SOL_SOCKET,
                    libc::SO_DONTROUTE,
                    libc::c_int::from(*value),
                )?;
            }
            SocketOption::InlineOutOfBand(value) => socket.set_out_of_band_inline(*value)?,
            #[cfg(target_os = "linux")]
            SocketOption::TxTimestamping(value) => {
                self.set_timestamping(*value, TIMESTAMPING_TX_FLAGS)?;
            }
            #[cfg(target_os = "linux")]
            SocketOption::RxTimestamping(value) => {
                self.set_timestamping(*value, TIMESTAMPING_RX_FLAGS)?;
            }
            #[cfg(target_os = "linux")]
            SocketOption::ZeroCopy(value) => {
                self.set_option_int(
                    libc::SOL_SOCKET,
                    libc::SO_ZEROCOPY,
                    libc::c_int::from(*value),
                )?;
            }
            #[cfg(target_os = "linux")]
            SocketOption::TcpCongestionControl(cc) => {
                socket.set_tcp_congestion(cc.algorithm().as_bytes())?;
            }
            _ => return Err(Error::new(ErrorKind::NotImplemented)),
        }
        Ok(())
    }

    /// Read back a single socket option by kind.
    pub fn get_option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        let socket = self.socket()?;
        let option = match kind {
            SocketOptionKind::ReuseAddress => {
                SocketOption::ReuseAddress(socket.reuse_address()?)
            }
            #[cfg(unix)]
            SocketOptionKind::ReusePort => SocketOption::ReusePort(socket.reuse_port()?),
            SocketOptionKind::KeepAlive => SocketOption::KeepAlive(socket.keepalive()?),
            SocketOptionKind::NoDelay => SocketOption::NoDelay(socket.nodelay()?),
            SocketOptionKind::Linger => {
                let value = socket.linger()?;
                SocketOption::Linger(Linger {
                    enabled: value.is_some(),
                    duration: value.unwrap_or(Duration::ZERO),
                })
            }
            SocketOptionKind::SendBufferSize => {
                SocketOption::SendBufferSize(socket.send_buffer_size()?)
            }
            SocketOptionKind::ReceiveBufferSize => {
                SocketOption::ReceiveBufferSize(socket.recv_buffer_size()?)
            }
            #[cfg(unix)]
            SocketOptionKind::SendLowWatermark => SocketOption::SendLowWatermark(
                self.get_option_int(libc::SOL_SOCKET, libc::SO_SNDLOWAT)? as usize,
            ),
            #[cfg(unix)]
            SocketOptionKind::ReceiveLowWatermark => SocketOption::ReceiveLowWatermark(
                self.get_option_int(libc::SOL_SOCKET, libc::SO_RCVLOWAT)? as usize,
            ),
            SocketOptionKind::Broadcast => SocketOption::Broadcast(socket.broadcast()?),
            #[cfg(unix)]
            SocketOptionKind::BypassRouting => SocketOption::BypassRouting(
                self.get_option_int(libc::SOL_SOCKET, libc::SO_DONTROUTE)? != 0,
            ),
            SocketOptionKind::InlineOutOfBand => {
                SocketOption::InlineOutOfBand(socket.out_of_band_inline()?)
            }
            #[cfg(target_os = "linux")]
            SocketOptionKind::TxTimestamping => {
                let flags = self.get_option_int(libc::SOL_SOCKET, libc::SO_TIMESTAMPING)?;
                SocketOption::TxTimestamping(flags & TIMESTAMPING_TX_FLAGS != 0)
            }
            #[cfg(target_os = "linux")]
            SocketOptionKind::RxTimestamping => {
                let flags = self.get_option_int(libc::SOL_SOCKET, libc::SO_TIMESTAMPING)?;
                SocketOption::RxTimestamping(flags & TIMESTAMPING_RX_FLAGS != 0)
            }
            #[cfg(target_os = "linux")]
            SocketOptionKind::ZeroCopy => SocketOption::ZeroCopy(
                self.get_option_int(libc::SOL_SOCKET, libc::SO_ZEROCOPY)? != 0,
            ),
            #[cfg(target_os = "linux")]
            SocketOptionKind::TcpCongestionControl => {
                let raw = socket.tcp_congestion()?;
                let name = String::from_utf8_lossy(&raw);
                let name = name.trim_end_matches('\0');
                SocketOption::TcpCongestionControl(TcpCongestionControl::new(name))
            }
            _ => return Err(Error::new(ErrorKind::NotImplemented)),
        };
        Ok(option)
    }

    /// Enable or disable multicast loopback.
    pub fn set_multicast_loopback(&self, enabled: bool) -> Result<()> {
        let socket = self.socket()?;
        match self.transport.family() {
            TransportFamily::Ipv4 => socket.set_multicast_loop_v4(enabled)?,
            TransportFamily::Ipv6 => socket.set_multicast_loop_v6(enabled)?,
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        Ok(())
    }

    /// Select the interface used for outgoing multicast datagrams.
    pub fn set_multicast_interface(&self, interface: &IpAddr) -> Result<()> {
        let socket = self.socket()?;
        match interface {
            IpAddr::V4(addr) => socket.set_multicast_if_v4(addr)?,
            // IPv6 selects interfaces by index; the default interface is 0.
            IpAddr::V6(_) => socket.set_multicast_if_v6(0)?,
        }
        Ok(())
    }

    /// Set the time-to-live of outgoing multicast datagrams.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        let socket = self.socket()?;
        match self.transport.family() {
            TransportFamily::Ipv4 => socket.set_multicast_ttl_v4(ttl)?,
            TransportFamily::Ipv6 => socket.set_multicast_hops_v6(ttl)?,
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        Ok(())
    }

    /// Join the specified multicast `group` on `interface`.
    pub fn join_multicast_group(&self, group: &IpAddr, interface: &IpAddr) -> Result<()> {
        let socket = self.socket()?;
        match (group, interface) {
            (IpAddr::V4(group), IpAddr::V4(interface)) => {
                socket.join_multicast_v4(group, interface)?;
            }
            (IpAddr::V6(group), _) => socket.join_multicast_v6(group, 0)?,
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        Ok(())
    }

    /// Leave the specified multicast `group` on `interface`.
    pub fn leave_multicast_group(&self, group: &IpAddr, interface: &IpAddr) -> Result<()> {
        let socket = self.socket()?;
        match (group, interface) {
            (IpAddr::V4(group), IpAddr::V4(interface)) => {
                socket.leave_multicast_v4(group, interface)?;
            }
            (IpAddr::V6(group), _) => socket.leave_multicast_v6(group, 0)?,
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        Ok(())
    }

    /// Join the specified source-specific multicast `group`.
    pub fn join_multicast_group_source(
        &self,
        group: &IpAddr,
        source: &IpAddr,
        interface: &IpAddr,
    ) -> Result<()> {
        let socket = self.socket()?;
        match (group, source, interface) {
            (IpAddr::V4(group), IpAddr::V4(source), IpAddr::V4(interface)) => {
                socket.join_ssm_v4(source, group, interface)?;
            }
            _ => return Err(Error::new(ErrorKind::NotImplemented)),
        }
        Ok(())
    }

    /// Leave the specified source-specific multicast `group`.
    pub fn leave_multicast_group_source(
        &self,
        group: &IpAddr,
        source: &IpAddr,
        interface: &IpAddr,
    ) -> Result<()> {
        let socket = self.socket()?;
        match (group, source, interface) {
            (IpAddr::V4(group), IpAddr::V4(source), IpAddr::V4(interface)) => {
                socket.leave_ssm_v4(source, group, interface)?;
            }
            _ => return Err(Error::new(ErrorKind::NotImplemented)),
        }
        Ok(())
    }

    /// Drain the socket's error queue into typed notifications. Empty
    /// when nothing is pending; on platforms without an error queue,
    /// always empty.
    #[cfg(target_os = "linux")]
    pub fn receive_notifications(&self) -> Result<Vec<Notification>> {
        const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
        const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
        const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;
        const SCM_TSTAMP_SCHED: u32 = 1;
        const SCM_TSTAMP_ACK: u32 = 2;

        let fd = self.handle()?;
        let mut notifications = Vec::new();
        loop {
            let mut data = [0u8; 256];
            let mut control = [0u8; 512];
            let mut iov = libc::iovec {
                iov_base: data.as_mut_ptr().cast(),
                iov_len: data.len(),
            };
            // SAFETY: a zeroed msghdr is a valid starting point; every
            // pointer set below outlives the recvmsg call.
            let mut header: libc::msghdr = unsafe { std::mem::zeroed() };
            header.msg_iov = &mut iov;
            header.msg_iovlen = 1;
            header.msg_control = control.as_mut_ptr().cast();
            header.msg_controllen = control.len() as _;

            // SAFETY: the buffers referenced by the header are live and
            // sized as declared.
            let received = unsafe {
                libc::recvmsg(fd, &mut header, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
            };
            if received < 0 {
                let err = Error::last_os_error();
                if err.kind() == ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }

            let mut stamp: Option<libc::timespec> = None;
            let mut kind = TimestampKind::Sent;
            let mut id = 0u32;
            let mut timestamped = false;

            // SAFETY: cmsg traversal stays within msg_control as
            // delimited by the kernel-written msg_controllen.
            let mut cursor = unsafe { libc::CMSG_FIRSTHDR(&header) };
            while !cursor.is_null() {
                let cmsg = unsafe { &*cursor };
                if cmsg.cmsg_level == libc::SOL_SOCKET
                    && cmsg.cmsg_type == libc::SCM_TIMESTAMPING
                {
                    // SAFETY: SCM_TIMESTAMPING carries three timespecs.
                    let stamps = unsafe {
                        &*(libc::CMSG_DATA(cursor) as *const [libc::timespec; 3])
                    };
                    stamp = Some(stamps[0]);
                } else if (cmsg.cmsg_level == libc::SOL_IP && cmsg.cmsg_type == libc::IP_RECVERR)
                    || (cmsg.cmsg_level == libc::SOL_IPV6
                        && cmsg.cmsg_type == libc::IPV6_RECVERR)
                {
                    // SAFETY: IP_RECVERR carries a sock_extended_err.
                    let extended = unsafe {
                        &*(libc::CMSG_DATA(cursor) as *const libc::sock_extended_err)
                    };
                    match extended.ee_origin {
                        SO_EE_ORIGIN_ZEROCOPY => {
                            notifications.push(Notification::ZeroCopy(ZeroCopy {
                                from: extended.ee_info,
                                to: extended.ee_data,
                                copied: extended.ee_code == SO_EE_CODE_ZEROCOPY_COPIED,
                            }));
                        }
                        SO_EE_ORIGIN_TIMESTAMPING => {
                            timestamped = true;
                            id = extended.ee_data;
                            kind = match extended.ee_info {
                                SCM_TSTAMP_SCHED => TimestampKind::Scheduled,
                                SCM_TSTAMP_ACK => TimestampKind::Acknowledged,
                                _ => TimestampKind::Sent,
                            };
                        }
                        _ => {}
                    }
                }
                cursor = unsafe { libc::CMSG_NXTHDR(&header, cursor) };
            }

            if timestamped {
                if let Some(spec) = stamp {
                    let time = std::time::SystemTime::UNIX_EPOCH
                        + Duration::new(spec.tv_sec as u64, spec.tv_nsec as u32);
                    notifications.push(Notification::Timestamp(Timestamp { kind, id, time }));
                }
            }
        }
        Ok(notifications)
    }

    /// See the Linux implementation; here the error queue is absent.
    #[cfg(not(target_os = "linux"))]
    pub fn receive_notifications(&self) -> Result<Vec<Notification>> {
        let _ = self.socket()?;
        Ok(Vec::new())
    }

    #[cfg(unix)]
    fn set_option_int(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
        let fd = self.handle()?;
        // SAFETY: a 4-byte integer option written with the matching length.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(unix)]
    fn get_option_int(&self, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int> {
        let fd = self.handle()?;
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: a 4-byte integer option read with the matching length.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                level,
                name,
                std::ptr::addr_of_mut!(value).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(value)
    }

    #[cfg(target_os = "linux")]
    fn set_timestamping(&self, enabled: bool, flags: libc::c_int) -> Result<()> {
        let current = self
            .get_option_int(libc::SOL_SOCKET, libc::SO_TIMESTAMPING)
            .unwrap_or(0);
        let next = if enabled {
            current | flags
        } else {
            current & !flags
        };
        self.set_option_int(libc::SOL_SOCKET, libc::SO_TIMESTAMPING, next)
    }
}

#[cfg(target_os = "linux")]
const TIMESTAMPING_TX_FLAGS: libc::c_int = (libc::SOF_TIMESTAMPING_TX_SOFTWARE
    | libc::SOF_TIMESTAMPING_SOFTWARE
    | libc::SOF_TIMESTAMPING_OPT_ID) as libc::c_int;

#[cfg(target_os = "linux")]
const TIMESTAMPING_RX_FLAGS: libc::c_int =
    (libc::SOF_TIMESTAMPING_RX_SOFTWARE | libc::SOF_TIMESTAMPING_SOFTWARE) as libc::c_int;

/// View a byte buffer as an uninitialized receive buffer.
fn uninit_view(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8, and the OS only
    // writes initialized bytes into the slice.
    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) }
}

fn endpoint_to_sockaddr(endpoint: &Endpoint) -> Result<SockAddr> {
    match endpoint {
        Endpoint::Ip(addr) => Ok(SockAddr::from(*addr)),
        #[cfg(unix)]
        Endpoint::Local(LocalEndpoint::Path(path)) => Ok(SockAddr::unix(path)?),
        Endpoint::Local(LocalEndpoint::Abstract(_)) => Err(Error::new(ErrorKind::NotImplemented)),
        #[cfg(not(unix))]
        Endpoint::Local(_) => Err(Error::new(ErrorKind::NotImplemented)),
        Endpoint::Undefined => Err(Error::new(ErrorKind::Invalid)),
    }
}

fn sockaddr_to_endpoint(addr: &SockAddr) -> Endpoint {
    if let Some(socket_addr) = addr.as_socket() {
        return Endpoint::Ip(socket_addr);
    }
    if let Some(path) = addr.as_pathname() {
        return Endpoint::Local(LocalEndpoint::Path(path.to_path_buf()));
    }
    Endpoint::Undefined
}

fn anonymous_local_path() -> PathBuf {
    let unique = ANONYMOUS_LOCAL_NAME.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "spindrift-{}-{}.sock",
        std::process::id(),
        unique
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn open_close_idempotent() {
        let mut descriptor = Descriptor::new();
        assert!(!descriptor.is_open());

        descriptor.open(Transport::TcpIpv4).unwrap();
        assert!(descriptor.is_open());
        assert_eq!(descriptor.transport(), Transport::TcpIpv4);

        // A second open fails while the first handle is owned.
        assert_eq!(
            descriptor.open(Transport::TcpIpv4).unwrap_err().kind(),
            ErrorKind::Already
        );

        descriptor.close().unwrap();
        assert!(!descriptor.is_open());
        descriptor.close().unwrap();
        assert!(!descriptor.is_open());
    }

    #[test]
    fn open_undefined_is_invalid() {
        let mut descriptor = Descriptor::new();
        assert_eq!(
            descriptor.open(Transport::Undefined).unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[cfg(unix)]
    #[test]
    fn release_and_acquire_round_trip() {
        let mut first = Descriptor::new();
        first.open(Transport::UdpIpv4).unwrap();
        let handle = first.release().unwrap();
        assert!(!first.is_open());

        let mut second = Descriptor::new();
        second.acquire(handle, Transport::UdpIpv4).unwrap();
        assert!(second.is_open());
        assert_eq!(
            second.acquire(handle, Transport::UdpIpv4).unwrap_err().kind(),
            ErrorKind::Already
        );
    }

    #[test]
    fn bind_any_yields_defined_source() {
        let mut descriptor = Descriptor::new();
        descriptor.open(Transport::UdpIpv4).unwrap();
        descriptor.bind_any(false).unwrap();

        let endpoint = descriptor.source_endpoint().unwrap();
        let addr = endpoint.ip().expect("ip endpoint");
        assert!(addr.port() != 0);
    }

    #[test]
    fn options_round_trip() {
        let mut descriptor = Descriptor::new();
        descriptor.open(Transport::TcpIpv4).unwrap();

        descriptor
            .set_option(&SocketOption::ReuseAddress(true))
            .unwrap();
        assert_eq!(
            descriptor.get_option(SocketOptionKind::ReuseAddress).unwrap(),
            SocketOption::ReuseAddress(true)
        );

        descriptor.set_option(&SocketOption::NoDelay(true)).unwrap();
        assert_eq!(
            descriptor.get_option(SocketOptionKind::NoDelay).unwrap(),
            SocketOption::NoDelay(true)
        );

        descriptor
            .set_option(&SocketOption::Linger(Linger::new(
                true,
                Duration::from_secs(1),
            )))
            .unwrap();
        match descriptor.get_option(SocketOptionKind::Linger).unwrap() {
            SocketOption::Linger(linger) => assert!(linger.enabled),
            other => panic!("unexpected option {other:?}"),
        }
    }

    #[test]
    fn stream_loopback_transfer() {
        let mut listener = Descriptor::new();
        listener.open(Transport::TcpIpv4).unwrap();
        listener
            .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
            .unwrap();
        listener.listen(1).unwrap();
        let server_endpoint = listener.source_endpoint().unwrap();

        let mut client = Descriptor::new();
        client.open(Transport::TcpIpv4).unwrap();
        client.connect(&server_endpoint).unwrap();

        let (accepted, _peer) = listener.accept().unwrap();

        let payload = SendPayload::from(Bytes::from_static(b"ping"));
        let sent = client.send(&payload, 0).unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let received = accepted.receive(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"ping");

        // Vectored payloads transfer in order.
        let payload = SendPayload::from(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cd"),
        ]);
        accepted.send(&payload, 1).unwrap();
        let received = client.receive(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"bcd");

        client.shutdown(ShutdownDirection::Send).unwrap();
        let received = accepted.receive(&mut buf).unwrap();
        assert_eq!(received, 0);
    }

    #[test]
    fn datagram_loopback_transfer() {
        let mut first = Descriptor::new();
        first.open(Transport::UdpIpv4).unwrap();
        first.bind_any(false).unwrap();

        let mut second = Descriptor::new();
        second.open(Transport::UdpIpv4).unwrap();
        second.bind_any(false).unwrap();

        let target = second.source_endpoint().unwrap();
        let sent = first
            .send_to(&SendPayload::from(Bytes::from_static(b"\x55")), &target)
            .unwrap();
        assert_eq!(sent, 1);

        let mut buf = [0u8; 4];
        let (len, origin) = second.receive_from(&mut buf).unwrap();
        assert_eq!(len, 1);
        assert_eq!(buf[0], 0x55);
        assert_eq!(origin, first.source_endpoint().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn error_queue_starts_empty() {
        let mut descriptor = Descriptor::new();
        descriptor.open(Transport::UdpIpv4).unwrap();
        descriptor.bind_any(false).unwrap();
        assert!(descriptor.receive_notifications().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn local_listener_unlink() {
        let mut listener = Descriptor::new();
        listener.open(Transport::LocalStream).unwrap();
        listener.bind_any(false).unwrap();
        listener.listen(1).unwrap();

        let endpoint = listener.source_endpoint().unwrap();
        let path = endpoint
            .local()
            .and_then(LocalEndpoint::as_path)
            .expect("path endpoint")
            .to_path_buf();
        assert!(path.exists());

        listener.unlink().unwrap();
        assert!(!path.exists());
    }
}
