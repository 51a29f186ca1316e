//! The self-pipe wake controller.
//!
//! A controller is a non-blocking socket pair whose read end is
//! registered with a multiplexer under a reserved token. Writing one
//! byte increments the interrupt count and makes the read end
//! readable; acknowledging drains it. Waiters must tolerate spurious
//! wake-ups by detecting an empty controller and looping.

use std::sync::atomic::{AtomicU64, Ordering};

use spindrift_core::descriptor::{Descriptor, Handle};
use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{ErrorKind, Result};
use spindrift_core::operation::SendPayload;
use spindrift_core::transport::Transport;

use bytes::Bytes;

/// The reserved registration token for a multiplexer's controller.
pub const CONTROLLER_TOKEN: usize = 0;

/// A self-pipe used to wake a blocked multiplexer wait.
#[derive(Debug)]
pub struct Controller {
    reader: Descriptor,
    writer: Descriptor,
    interrupts: AtomicU64,
}

impl Controller {
    /// Create a controller. Local sockets are preferred; a TCP loopback
    /// pair is the fallback where they are unavailable.
    pub fn new() -> Result<Self> {
        match Self::local_pair() {
            Ok(controller) => Ok(controller),
            Err(_) => Self::loopback_pair(),
        }
    }

    #[cfg(unix)]
    fn local_pair() -> Result<Self> {
        let (reader_socket, writer_socket) =
            socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;

        let mut reader = Descriptor::new();
        let mut writer = Descriptor::new();
        {
            use std::os::fd::IntoRawFd;
            reader.acquire(reader_socket.into_raw_fd(), Transport::LocalStream)?;
            writer.acquire(writer_socket.into_raw_fd(), Transport::LocalStream)?;
        }
        reader.set_blocking(false)?;
        writer.set_blocking(false)?;

        Ok(Self {
            reader,
            writer,
            interrupts: AtomicU64::new(0),
        })
    }

    #[cfg(not(unix))]
    fn local_pair() -> Result<Self> {
        Err(spindrift_core::error::Error::new(ErrorKind::NotImplemented))
    }

    fn loopback_pair() -> Result<Self> {
        let mut listener = Descriptor::new();
        listener.open(Transport::TcpIpv4)?;
        listener.bind(&Endpoint::parse("127.0.0.1:0")?, false)?;
        listener.listen(1)?;

        let mut writer = Descriptor::new();
        writer.open(Transport::TcpIpv4)?;
        writer.connect(&listener.source_endpoint()?)?;

        let (reader, _peer) = listener.accept()?;
        reader.set_blocking(false)?;
        writer.set_blocking(false)?;

        Ok(Self {
            reader,
            writer,
            interrupts: AtomicU64::new(0),
        })
    }

    /// The handle a multiplexer registers for readability.
    pub fn handle(&self) -> Result<Handle> {
        self.reader.handle()
    }

    /// Wake the multiplexer `count` times.
    pub fn interrupt(&self, count: usize) {
        self.interrupts.fetch_add(count as u64, Ordering::Relaxed);
        let byte = SendPayload::Bytes(Bytes::from_static(&[1u8]));
        for _ in 0..count {
            match self.writer.send(&byte, 0) {
                Ok(_) => {}
                // A full pipe already guarantees a pending wake-up.
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(error = %err, "controller interrupt failed");
                    break;
                }
            }
        }
    }

    /// Drain pending interrupts after a wake-up.
    pub fn acknowledge(&self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.reader.receive(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// How many interrupts have been requested over this controller's
    /// lifetime.
    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_makes_reader_readable() {
        let controller = Controller::new().unwrap();

        let mut buf = [0u8; 8];
        // Nothing pending: the read end reports would-block.
        assert_eq!(
            controller.reader.receive(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        controller.interrupt(2);
        assert_eq!(controller.interrupts(), 2);

        // Two pending bytes, then empty again after acknowledging.
        controller.acknowledge().unwrap();
        assert_eq!(
            controller.reader.receive(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        controller.interrupt(1);
        controller.acknowledge().unwrap();
        assert_eq!(controller.interrupts(), 3);
    }

    #[test]
    fn loopback_fallback_works() {
        let controller = Controller::loopback_pair().unwrap();
        controller.interrupt(1);
        controller.acknowledge().unwrap();
    }
}
