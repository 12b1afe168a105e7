// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Paced UDP channel, one per network interface.
//!
//! The socket is created with `socket2` (reuse-address, nonblocking) and
//! handed to `mio` for readiness polling. Interface 0 is the ray path;
//! interface 1 carries service traffic only.

use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};

use super::pace::Pacer;

/// A UDP socket with an advisory pacer and byte/packet counters.
#[derive(Debug)]
pub struct PacedUdpChannel {
    socket: UdpSocket,
    pacer: Pacer,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl PacedUdpChannel {
    /// Bind a channel. Port 0 lets the OS pick (the coordinator learns our
    /// addresses from the socket, not from configuration).
    pub fn bind(addr: SocketAddr, rate_mbps: u64) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_socket);
        log::debug!(
            "[UDP] channel bound addr={} rate={}Mbps",
            socket.local_addr()?,
            rate_mbps
        );

        Ok(Self {
            socket,
            pacer: Pacer::new(rate_mbps),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Mutable socket handle for reactor registration.
    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    /// Send one datagram, charging the pacer and counters.
    pub fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(data, dest)?;
        self.bytes_sent += sent as u64;
        self.packets_sent += 1;
        self.pacer.record_send(sent);
        Ok(sent)
    }

    /// Receive one datagram if available. `Ok(None)` when the socket has
    /// nothing pending.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.socket.recv_from(buf) {
            Ok((len, source)) => {
                self.bytes_received += len as u64;
                self.packets_received += 1;
                Ok(Some((source, len)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn within_pace(&self) -> bool {
        self.pacer.within_pace()
    }

    pub fn micros_ahead_of_pace(&self) -> i64 {
        self.pacer.micros_ahead_of_pace()
    }

    pub fn set_rate(&mut self, rate_mbps: u64) {
        log::debug!("[UDP] pace changed to {}Mbps", rate_mbps);
        self.pacer.set_rate(rate_mbps);
    }

    pub fn reset_reference(&mut self) {
        self.pacer.reset_reference();
    }
}
