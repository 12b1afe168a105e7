// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The worker: all runtime state plus the event handlers.
//!
//! Strictly single-threaded. Every handler runs to completion between two
//! reactor polls; there are no locks and no partially observed states.
//! Handlers are selected by [`Event`] value; their predicates are evaluated
//! here, right before dispatch.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::{Interest, Token};
use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{
    FinishedRayAction, WorkerConfig, ACK_SCAN_INTERVAL, BENCHMARK_CHECKPOINT_INTERVAL,
    BENCHMARK_PAYLOAD_BYTES, DIAGNOSTICS_INTERVAL, FINISHED_DISCARD_WATERMARK,
    FINISHED_PATHS_INTERVAL, LOG_STREAM_ENVAR, MAX_RAYS_PER_ACTIVATION, OUT_QUEUE_INTERVAL,
    PACKET_HEADER_RESERVE, PACKET_TIMEOUT, PEER_INTERVAL, UDP_MTU_BYTES, WORKER_STATS_INTERVAL,
};
use crate::engine::benchmark::BenchmarkData;
use crate::engine::coordinator::CoordinatorLink;
use crate::engine::reactor::{Reactor, Trigger};
use crate::engine::Event;
use crate::error::{Error, Result};
use crate::peers::{PeerState, PeerTable};
use crate::protocol::codec::MessageParser;
use crate::protocol::records::{
    put_record, read_record, ConnectRequest, ConnectResponse, ConnectTo, FinishedRay,
    GenerateRays, GetObjects, GetWorker, Hey, ObjectKind, StartBenchmark,
};
use crate::protocol::wire::put_u64;
use crate::protocol::{Message, OpCode};
use crate::queues::{Placement, RayQueues};
use crate::ray::{RayState, WorkerId};
use crate::reliability::{parse_ack_payload, AckLedger, RayPacket, SequenceSpace, ServicePacket};
use crate::scene::SceneContext;
use crate::stats::{
    log_packet_action, log_ray_action, DiagnosticsWindow, PacketAction, QueueStats, RayAction,
    WorkerStats,
};
use crate::storage::StorageBackend;
use crate::tracer::Tracer;
use crate::transport::{PacedUdpChannel, NUM_INTERFACES, RAY_INTERFACE};

const TOKEN_UDP0: Token = Token(0);
const TOKEN_UDP1: Token = Token(1);
const TOKEN_COORDINATOR: Token = Token(2);

const ANY_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    0,
);

/// Rec. 709 luminance of an RGB triple.
fn luminance(l: [f32; 3]) -> f32 {
    0.212_671 * l[0] + 0.715_160 * l[1] + 0.072_169 * l[2]
}

/// The distributed ray-tracing worker.
pub struct Worker {
    config: WorkerConfig,
    storage: Box<dyn StorageBackend>,
    tracer: Box<dyn Tracer>,
    pub scene: SceneContext,

    worker_id: Option<WorkerId>,
    job_id: Option<String>,
    my_seed: u32,
    coordinator_addr: SocketAddr,

    udp: [PacedUdpChannel; NUM_INTERFACES],
    coordinator: CoordinatorLink,

    pub peers: PeerTable,
    pub queues: RayQueues,
    pub seq_space: SequenceSpace,
    pub ledger: AckLedger,

    pub ray_packets: VecDeque<RayPacket>,
    pub service_packets: VecDeque<ServicePacket>,
    message_parser: MessageParser,

    pub stats: WorkerStats,
    last_diagnostics: DiagnosticsWindow,
    ack_id: u64,

    rng: StdRng,
    packet_log_dist: Bernoulli,
    ray_log_dist: Bernoulli,

    reactor: Reactor<Event>,
    actions: HashMap<Event, usize>,
    benchmark: Option<BenchmarkData>,
    terminated: bool,
}

impl Worker {
    /// Bind the channels, connect the control channel, register the action
    /// table, and send the initial `Hey` request.
    pub fn new(
        coordinator_addr: SocketAddr,
        storage: Box<dyn StorageBackend>,
        tracer: Box<dyn Tracer>,
        config: WorkerConfig,
    ) -> Result<Self> {
        if !config.validate() {
            return Err(Error::Config("invalid worker configuration".to_string()));
        }

        let packet_log_dist = Bernoulli::new(config.packet_log_rate)
            .map_err(|_| Error::Config("packet log rate out of range".to_string()))?;
        let ray_log_dist = Bernoulli::new(config.ray_log_rate)
            .map_err(|_| Error::Config("ray log rate out of range".to_string()))?;

        let mut rng = StdRng::from_entropy();
        let mut my_seed = 0u32;
        while my_seed == 0 {
            my_seed = rng.gen();
        }

        let mut udp = [
            PacedUdpChannel::bind(ANY_ADDR, config.max_udp_rate_mbps).map_err(Error::Transport)?,
            PacedUdpChannel::bind(ANY_ADDR, config.max_udp_rate_mbps).map_err(Error::Transport)?,
        ];
        let mut coordinator =
            CoordinatorLink::connect(coordinator_addr).map_err(Error::CoordinatorLost)?;

        let reactor = Reactor::new().map_err(Error::Transport)?;
        let registry = reactor.registry();
        registry
            .register(udp[0].socket_mut(), TOKEN_UDP0, Interest::READABLE)
            .map_err(Error::Transport)?;
        registry
            .register(udp[1].socket_mut(), TOKEN_UDP1, Interest::READABLE)
            .map_err(Error::Transport)?;
        registry
            .register(
                coordinator.stream_mut(),
                TOKEN_COORDINATOR,
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(Error::Transport)?;

        let log_stream = std::env::var(LOG_STREAM_ENVAR).unwrap_or_default();
        coordinator.enqueue_write(
            Message::new(0, OpCode::Hey, log_stream.into_bytes()).encode(),
        );

        let mut worker = Self {
            config,
            storage,
            tracer,
            scene: SceneContext::new(),
            worker_id: None,
            job_id: None,
            my_seed,
            coordinator_addr,
            udp,
            coordinator,
            peers: PeerTable::new(),
            queues: RayQueues::new(),
            seq_space: SequenceSpace::new(),
            ledger: AckLedger::new(),
            ray_packets: VecDeque::new(),
            service_packets: VecDeque::new(),
            message_parser: MessageParser::new(),
            stats: WorkerStats::new(),
            last_diagnostics: DiagnosticsWindow::default(),
            ack_id: 0,
            rng,
            packet_log_dist,
            ray_log_dist,
            reactor,
            actions: HashMap::new(),
            benchmark: None,
            terminated: false,
        };
        worker.register_actions();
        Ok(worker)
    }

    fn register_actions(&mut self) {
        let table = [
            (Event::UdpReceive(0), Trigger::Readable(TOKEN_UDP0)),
            (Event::UdpReceive(1), Trigger::Readable(TOKEN_UDP1)),
            (Event::RayAcks, Trigger::Every(ACK_SCAN_INTERVAL)),
            (Event::UdpSend(0), Trigger::Ready),
            (Event::UdpSend(1), Trigger::Ready),
            (Event::RayQueue, Trigger::Ready),
            (Event::OutQueue, Trigger::Every(OUT_QUEUE_INTERVAL)),
            (Event::FinishedQueue, Trigger::Ready),
            (Event::Peers, Trigger::Every(PEER_INTERVAL)),
            (Event::Messages, Trigger::Ready),
            (Event::NeededTreelets, Trigger::Ready),
            (Event::FinishedPaths, Trigger::Every(FINISHED_PATHS_INTERVAL)),
            (Event::WorkerStats, Trigger::Every(WORKER_STATS_INTERVAL)),
            (Event::Diagnostics, Trigger::Every(DIAGNOSTICS_INTERVAL)),
            (Event::CoordinatorRead, Trigger::Readable(TOKEN_COORDINATOR)),
            (Event::CoordinatorFlush, Trigger::Ready),
        ];
        for (event, trigger) in table {
            let id = self.reactor.register(event, trigger);
            self.actions.insert(event, id);
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// This worker's handshake seed (echoed back by valid responses).
    pub fn handshake_seed(&self) -> u32 {
        self.my_seed
    }

    /// Local address of one UDP interface.
    pub fn udp_local_addr(&self, iface: usize) -> Result<SocketAddr> {
        self.udp[iface].local_addr().map_err(Error::Transport)
    }

    /// Flush buffered coordinator writes (also runs as the
    /// `CoordinatorFlush` action).
    pub fn coordinator_flush(&mut self) -> Result<()> {
        self.coordinator.flush().map_err(Error::CoordinatorLost)
    }

    fn my_id(&self) -> WorkerId {
        self.worker_id.unwrap_or(0)
    }

    fn track_rays(&self) -> bool {
        self.config.ray_log_rate > 0.0
    }

    fn track_packets(&self) -> bool {
        self.config.packet_log_rate > 0.0
    }

    /// Whether an event is eligible to run right now.
    pub fn predicate(&self, event: Event) -> bool {
        match event {
            Event::UdpReceive(_) | Event::CoordinatorRead => true,
            Event::UdpSend(0) => {
                (self.service_packets.iter().any(|p| p.iface == 0)
                    || !self.ray_packets.is_empty())
                    && self.udp[0].within_pace()
            }
            Event::UdpSend(_) => {
                self.service_packets.iter().any(|p| p.iface == 1) && self.udp[1].within_pace()
            }
            Event::RayQueue => !self.queues.ray_queue.is_empty(),
            Event::OutQueue => self.queues.out_queue_size() > 0,
            Event::FinishedQueue => match self.config.finished_ray_action {
                FinishedRayAction::Discard => {
                    self.queues.finished_queue.len() > FINISHED_DISCARD_WATERMARK
                }
                FinishedRayAction::SendBack => !self.queues.finished_queue.is_empty(),
                FinishedRayAction::Upload => false,
            },
            Event::Peers => !self.peers.is_empty(),
            Event::Messages => !self.message_parser.is_empty(),
            Event::RayAcks => {
                self.ledger.has_pending_acks()
                    || (self.ledger.any_acks()
                        && self
                            .ledger
                            .front_deadline()
                            .is_some_and(|deadline| deadline <= Instant::now()))
            }
            Event::WorkerStats | Event::Diagnostics => true,
            Event::NeededTreelets => !self.queues.needed_treelets.is_empty(),
            Event::FinishedPaths => !self.queues.finished_path_ids.is_empty(),
            Event::CoordinatorFlush => self.coordinator.has_pending_writes(),
            Event::BenchSend(iface) => self.benchmark.is_some() && self.udp[iface].within_pace(),
            Event::BenchReceive(_) => self.benchmark.is_some(),
            Event::BenchCheckpoint | Event::BenchStop => self.benchmark.is_some(),
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::UdpReceive(iface) => self.handle_udp_receive(iface),
            Event::UdpSend(iface) => self.handle_udp_send(iface),
            Event::RayQueue => self.handle_ray_queue(),
            Event::OutQueue => self.handle_out_queue(),
            Event::FinishedQueue => self.handle_finished_queue(),
            Event::Peers => self.handle_peers(),
            Event::Messages => self.handle_messages(),
            Event::RayAcks => self.handle_ray_acknowledgements(),
            Event::WorkerStats => self.handle_worker_stats(),
            Event::Diagnostics => self.handle_diagnostics(),
            Event::NeededTreelets => self.handle_needed_treelets(),
            Event::FinishedPaths => self.handle_finished_paths(),
            Event::CoordinatorRead => self.handle_coordinator_read(),
            Event::CoordinatorFlush => self.coordinator.flush().map_err(Error::CoordinatorLost),
            Event::BenchSend(iface) => self.handle_bench_send(iface),
            Event::BenchReceive(iface) => self.handle_bench_receive(iface),
            Event::BenchCheckpoint => {
                if let Some(bench) = self.benchmark.as_mut() {
                    bench.take_checkpoint();
                }
                Ok(())
            }
            Event::BenchStop => self.handle_bench_stop(),
        }
    }

    /// Drive the reactor until terminated or a fatal error.
    pub fn run(&mut self) -> Result<()> {
        let mut fired = Vec::with_capacity(32);

        while !self.terminated {
            // Pacing hint: how long until some interface is sendable again.
            let mut pace_hint: Option<Duration> = None;
            for channel in &self.udp {
                if !channel.within_pace() {
                    let ahead =
                        Duration::from_micros(channel.micros_ahead_of_pace().max(1) as u64);
                    pace_hint = Some(pace_hint.map_or(ahead, |current| current.min(ahead)));
                }
            }

            // A ready always-eligible action forbids sleeping.
            let immediate = self
                .reactor
                .ready_candidates()
                .any(|event| self.predicate(event));
            let timeout = if immediate {
                Some(Duration::ZERO)
            } else {
                pace_hint
            };

            {
                // Split borrow: the reactor never touches worker state.
                let reactor = &mut self.reactor;
                reactor.poll_once(timeout, &mut fired).map_err(Error::Transport)?;
            }

            for index in 0..fired.len() {
                let event = fired[index];
                if self.terminated {
                    break;
                }
                if !self.predicate(event) {
                    continue;
                }
                self.dispatch(event)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Ray pipeline
    // ========================================================================

    fn record_finished_path(&mut self, path_id: u64) {
        self.stats.rays.finished_paths += 1;
        self.queues.finished_path_ids.push(path_id);
    }

    /// Classify a processed or generated ray, with stats and trace logging.
    fn classify_processed(&mut self, ray: RayState) {
        self.stats.rays.demanded += 1;
        let logged = (self.track_rays() && ray.track).then(|| ray.clone());
        let my_id = self.my_id();
        let max_depth = self.scene.max_depth;

        match self.queues.classify(ray) {
            Placement::Local => {
                self.stats.rays.waiting += 1;
            }
            Placement::Out(_) => {
                self.stats.rays.sending += 1;
            }
            Placement::Pending(_) => {
                self.stats.rays.pending += 1;
                if let Some(ray) = &logged {
                    log_ray_action(my_id, ray, RayAction::Pending, my_id, max_depth);
                }
            }
        }
    }

    /// Trace/shade up to `MAX_RAYS_PER_ACTIVATION` rays. Processed rays are
    /// buffered locally and classified only after the whole batch, which
    /// preserves per-activation ordering.
    pub fn handle_ray_queue(&mut self) -> Result<()> {
        let mut processed: VecDeque<RayState> = VecDeque::new();
        let my_id = self.my_id();
        let track = self.track_rays();
        let max_depth = self.scene.max_depth;

        for _ in 0..MAX_RAYS_PER_ACTIVATION {
            let Some(ray) = self.queues.ray_queue.pop_front() else {
                break;
            };
            self.stats.rays.processed += 1;
            let path_id = ray.path_id();
            if track && ray.track {
                log_ray_action(my_id, &ray, RayAction::Traced, my_id, max_depth);
            }

            if !ray.to_visit_empty() {
                let traced = self.tracer.trace(ray, &self.scene);
                let hit = traced.hit;
                let empty_visit = traced.to_visit_empty();

                if traced.is_shadow_ray {
                    if hit || empty_visit {
                        let mut finished = traced;
                        if hit {
                            // Occluded: the light contributes nothing.
                            finished.ld = [0.0; 3];
                        }
                        if track && finished.track {
                            log_ray_action(my_id, &finished, RayAction::Finished, my_id, max_depth);
                        }
                        self.queues.finished_queue.push_back(finished);
                    } else {
                        processed.push_back(traced);
                    }
                } else if !empty_visit || hit {
                    processed.push_back(traced);
                } else {
                    // Escaped the scene.
                    let mut finished = traced;
                    finished.ld = [0.0; 3];
                    if track && finished.track {
                        log_ray_action(my_id, &finished, RayAction::Finished, my_id, max_depth);
                    }
                    self.queues.finished_queue.push_back(finished);
                    self.record_finished_path(path_id);
                }
            } else if ray.hit {
                let logged = (track && ray.track).then(|| ray.clone());
                let result = self.tracer.shade(ray, &self.scene);
                let spawned = !result.rays.is_empty();

                for new_ray in result.rays {
                    if track && new_ray.track {
                        log_ray_action(my_id, &new_ray, RayAction::Generated, my_id, max_depth);
                    }
                    processed.push_back(new_ray);
                }
                if result.path_finished {
                    self.record_finished_path(path_id);
                }
                if !spawned {
                    if let Some(ray) = &logged {
                        log_ray_action(my_id, ray, RayAction::Finished, my_id, max_depth);
                    }
                }
            } else {
                return Err(Error::InvariantViolation(
                    "ray with empty traversal stack and no hit in ray queue",
                ));
            }
        }

        while let Some(ray) = processed.pop_front() {
            self.classify_processed(ray);
        }
        Ok(())
    }

    /// Assemble MTU-bounded `SendRays` packets from the out queues.
    pub fn handle_out_queue(&mut self) -> Result<()> {
        let my_id = self.my_id();
        let track = self.track_rays();
        let track_packets = self.track_packets();
        let max_depth = self.scene.max_depth;

        for treelet in self.queues.out_treelets() {
            let Some(candidates) = self.queues.workers_for_treelet(treelet) else {
                continue;
            };
            let Some(peer_id) = candidates.choose(&mut self.rng).copied() else {
                continue;
            };
            let Some(peer) = self.peers.get(peer_id) else {
                continue;
            };
            let destination = peer.addresses[RAY_INTERFACE];
            let destination_id = peer.id;

            loop {
                let mut payload = Vec::new();
                let mut packet_len = PACKET_HEADER_RESERVE;
                let mut ray_count = 0usize;
                let mut tracked_rays = Vec::new();

                while packet_len < UDP_MTU_BYTES {
                    let Some(ray) = self.queues.pop_out(treelet) else {
                        break;
                    };
                    let record = ray.serialize();
                    let framed_len = record.len() + 4;

                    if ray_count > 0 && packet_len + framed_len > UDP_MTU_BYTES {
                        // Overflow ray leads the next packet for this peer.
                        self.queues.unpop_out(treelet, ray);
                        break;
                    }

                    if track && ray.track {
                        log_ray_action(my_id, &ray, RayAction::Queued, my_id, max_depth);
                    }
                    put_record(&mut payload, &record);
                    packet_len += framed_len;
                    ray_count += 1;
                    if ray.track {
                        tracked_rays.push(ray);
                    }
                }

                if ray_count == 0 {
                    break;
                }

                let sequence_number = self.seq_space.next(destination);
                let tracked = self.packet_log_dist.sample(&mut self.rng);
                let message = Message::with_transport(
                    my_id,
                    OpCode::SendRays,
                    payload,
                    self.config.send_reliably,
                    sequence_number,
                    tracked,
                );
                let packet = RayPacket::new(
                    destination,
                    destination_id,
                    treelet,
                    ray_count,
                    &message,
                    tracked_rays,
                );
                if track_packets && tracked {
                    log_packet_action(
                        my_id,
                        destination_id,
                        sequence_number,
                        0,
                        packet.data().len(),
                        ray_count,
                        PacketAction::Queued,
                    );
                }
                self.ray_packets.push_back(packet);
            }
        }
        Ok(())
    }

    /// Send at most one packet: the first service packet for this interface,
    /// else (interface 0 only) the front ray packet.
    pub fn handle_udp_send(&mut self, iface: usize) -> Result<()> {
        let my_id = self.my_id();
        let track_packets = self.track_packets();

        if let Some(position) = self.service_packets.iter().position(|p| p.iface == iface) {
            let packet = self
                .service_packets
                .remove(position)
                .ok_or(Error::InvariantViolation("service packet vanished"))?;
            self.udp[iface]
                .send_to(&packet.data, packet.destination)
                .map_err(Error::Transport)?;

            if track_packets && packet.is_ack && packet.tracked {
                log_packet_action(
                    my_id,
                    packet.destination_id,
                    packet.ack_id,
                    0,
                    packet.data.len(),
                    0,
                    PacketAction::AckSent,
                );
            }
            return Ok(());
        }

        if iface != RAY_INTERFACE {
            return Ok(());
        }
        let Some(mut packet) = self.ray_packets.pop_front() else {
            return Ok(());
        };

        self.udp[RAY_INTERFACE]
            .send_to(packet.data(), packet.destination)
            .map_err(Error::Transport)?;

        if packet.retransmission {
            self.stats.rays.resent += packet.ray_count as u64;
        } else {
            self.stats.rays.sent += packet.ray_count as u64;
        }

        let track = self.track_rays();
        let max_depth = self.scene.max_depth;
        for ray in &mut packet.tracked_rays {
            if track {
                log_ray_action(my_id, ray, RayAction::Sent, packet.destination_id, max_depth);
            }
            ray.tick += 1;
        }

        if track_packets && packet.tracked {
            log_packet_action(
                my_id,
                packet.destination_id,
                packet.sequence_number,
                packet.attempt,
                packet.data().len(),
                packet.ray_count,
                PacketAction::Sent,
            );
        }

        if packet.reliable {
            self.ledger
                .push_outstanding(Instant::now() + PACKET_TIMEOUT, packet);
        }
        Ok(())
    }

    /// Parse everything pending on an interface, then walk the completed
    /// window newest-to-oldest handling reliability metadata in place.
    pub fn handle_udp_receive(&mut self, iface: usize) -> Result<()> {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let received = self.udp[iface]
                .recv_from(&mut buf)
                .map_err(Error::Transport)?;
            let Some((source, len)) = received else {
                break;
            };
            self.message_parser.parse(&buf[..len]);
            self.process_received_window(source);
        }
        Ok(())
    }

    /// Newest-to-oldest walk over the completed messages, stopping at the
    /// first already-read message: acks are absorbed, duplicate reliable
    /// messages are dropped in place, everything else stays for the
    /// control-plane pass.
    fn process_received_window(&mut self, source: SocketAddr) {
        let my_id = self.worker_id.unwrap_or(0);
        let track_packets = self.config.packet_log_rate > 0.0;
        let ledger = &mut self.ledger;
        let messages = self.message_parser.completed_messages();

        let mut index = messages.len();
        while index > 0 {
            index -= 1;
            if messages[index].is_read() {
                break;
            }
            messages[index].set_read();

            if messages[index].reliable {
                let message = &messages[index];
                let entry = (message.sequence_number, message.tracked, message.attempt);
                if track_packets && message.tracked {
                    log_packet_action(
                        my_id,
                        message.sender_id,
                        message.sequence_number,
                        message.attempt,
                        message.total_len(),
                        0,
                        PacketAction::Received,
                    );
                }
                if !ledger.note_reliable(source, entry) {
                    messages.remove(index);
                    continue;
                }
            }

            if messages[index].opcode == OpCode::Ack {
                let message = &messages[index];
                if track_packets && message.tracked {
                    log_packet_action(
                        my_id,
                        message.sender_id,
                        message.sequence_number,
                        message.attempt,
                        message.total_len(),
                        0,
                        PacketAction::AckReceived,
                    );
                }
                match parse_ack_payload(&message.payload) {
                    Ok(entries) => {
                        let sender = message.sender_id;
                        for (seq_no, tracked, attempt) in entries {
                            ledger.record_ack(source, seq_no);
                            if track_packets && tracked {
                                log_packet_action(
                                    my_id,
                                    sender,
                                    seq_no,
                                    attempt,
                                    0,
                                    0,
                                    PacketAction::Acked,
                                );
                            }
                        }
                    }
                    Err(err) => log::warn!("[ACK] dropping malformed ack frame: {}", err),
                }
                messages.remove(index);
            }
        }
    }

    /// Drain pending acks into service packets, then retransmit due
    /// outstanding packets.
    pub fn handle_ray_acknowledgements(&mut self) -> Result<()> {
        let my_id = self.my_id();

        for (source, payloads) in self.ledger.drain_pending_acks() {
            let destination_id = self.peers.worker_for_address(source).unwrap_or(0);
            for payload in payloads {
                let ack_id = self.ack_id;
                self.ack_id += 1;
                let tracked = self.packet_log_dist.sample(&mut self.rng);
                let message =
                    Message::with_transport(my_id, OpCode::Ack, payload, false, ack_id, tracked);
                self.service_packets.push_back(ServicePacket::ack(
                    source,
                    destination_id,
                    message.encode(),
                    ack_id,
                    tracked,
                ));
            }
        }

        // The resend scan only runs once some ack has arrived from anywhere;
        // before that there is no evidence the network delivers acks at all.
        let now = Instant::now();
        while self.ledger.any_acks() {
            let Some(mut packet) = self.ledger.pop_due(now) else {
                break;
            };
            if self.ledger.is_acked(packet.destination, packet.sequence_number) {
                continue;
            }
            packet.increment_attempt();
            packet.retransmission = true;
            self.ray_packets.push_back(packet);
        }
        Ok(())
    }

    /// Apply the configured finished-ray policy.
    pub fn handle_finished_queue(&mut self) -> Result<()> {
        match self.config.finished_ray_action {
            FinishedRayAction::Discard => {
                self.queues.finished_queue.clear();
            }
            FinishedRayAction::SendBack => {
                let mut payload = Vec::new();
                while let Some(ray) = self.queues.finished_queue.pop_front() {
                    let mut l = ray.contribution();
                    let y = luminance(l);
                    if l.iter().any(|c| c.is_nan()) || y < -1e-5 || y.is_infinite() {
                        l = [0.0; 3];
                    }
                    let finished = FinishedRay {
                        sample_id: ray.sample.id,
                        p_film: ray.sample.p_film,
                        weight: ray.sample.weight,
                        l,
                    };
                    put_record(&mut payload, &finished.encode());
                }
                self.send_to_coordinator(OpCode::FinishedRays, payload);
            }
            FinishedRayAction::Upload => {}
        }
        Ok(())
    }

    /// Re-send handshakes for connecting peers; ping connected ones.
    pub fn handle_peers(&mut self) -> Result<()> {
        let my_id = self.my_id();
        let my_seed = self.my_seed;
        let now = Instant::now();
        let mut ping_payload = Vec::new();
        put_u64(&mut ping_payload, my_id);

        for peer in self.peers.iter_mut() {
            match peer.state {
                PeerState::Connecting => {
                    for iface in 0..NUM_INTERFACES {
                        let request = ConnectRequest {
                            worker_id: my_id,
                            my_seed,
                            your_seed: peer.seed,
                            address_no: iface as u32,
                        };
                        let message =
                            Message::new(my_id, OpCode::ConnectionRequest, request.encode());
                        self.service_packets.push_front(ServicePacket::new(
                            peer.addresses[iface],
                            peer.id,
                            message.encode(),
                            iface,
                        ));
                    }
                    peer.tries += 1;
                }
                PeerState::Connected => {
                    if peer.id > 0 && peer.keep_alive_due(now) {
                        let message =
                            Message::new(my_id, OpCode::Ping, ping_payload.clone());
                        self.service_packets.push_back(ServicePacket::new(
                            peer.addresses[RAY_INTERFACE],
                            peer.id,
                            message.encode(),
                            RAY_INTERFACE,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// One control-plane pass; deferred messages are re-queued for the next.
    pub fn handle_messages(&mut self) -> Result<()> {
        let mut deferred = Vec::new();
        while let Some(message) = self.message_parser.pop() {
            if !self.process_message(&message)? {
                deferred.push(message);
            }
        }
        for message in deferred {
            self.message_parser.push(message);
        }
        Ok(())
    }

    /// Request owners for treelets that have pending rays.
    pub fn handle_needed_treelets(&mut self) -> Result<()> {
        let needed: Vec<_> = self.queues.needed_treelets.iter().copied().collect();
        for treelet_id in needed {
            if self.queues.requested_treelets.contains(&treelet_id) {
                continue;
            }
            let payload = GetWorker { treelet_id }.encode();
            self.send_to_coordinator(OpCode::GetWorker, payload);
            self.queues.requested_treelets.insert(treelet_id);
        }
        self.queues.needed_treelets.clear();
        Ok(())
    }

    /// Flush completed path ids to the coordinator.
    pub fn handle_finished_paths(&mut self) -> Result<()> {
        let mut payload = Vec::with_capacity(self.queues.finished_path_ids.len() * 8);
        for path_id in self.queues.finished_path_ids.drain(..) {
            put_u64(&mut payload, path_id);
        }
        self.send_to_coordinator(OpCode::FinishedPaths, payload);
        Ok(())
    }

    /// Report queue depths and the rolling ray counters, then reset them.
    pub fn handle_worker_stats(&mut self) -> Result<()> {
        let queue_stats = QueueStats {
            ray: self.queues.ray_queue.len() as u64,
            finished: self.queues.finished_queue.len() as u64,
            pending: self.queues.pending_queue_size() as u64,
            out: self.queues.out_queue_size() as u64,
            connecting: self.peers.connecting_count() as u64,
            connected: (self.peers.len() - self.peers.connecting_count()) as u64,
            outstanding_udp: self.ledger.outstanding_len() as u64,
            queued_udp: self.ray_packets.len() as u64,
        };
        let report = self.stats.take_report(queue_stats);
        self.send_to_coordinator(OpCode::WorkerStats, report.encode());
        Ok(())
    }

    /// Log interface-0 byte deltas since the previous tick.
    pub fn handle_diagnostics(&mut self) -> Result<()> {
        let sent = self.udp[0].bytes_sent - self.last_diagnostics.bytes_sent;
        let received = self.udp[0].bytes_received - self.last_diagnostics.bytes_received;
        self.last_diagnostics.bytes_sent = self.udp[0].bytes_sent;
        self.last_diagnostics.bytes_received = self.udp[0].bytes_received;

        log::info!(
            target: "diag",
            "{} bytesSent={} bytesReceived={} queuedUdp={} outstandingUdp={}",
            self.stats.start_time.elapsed().as_micros(),
            sent,
            received,
            self.ray_packets.len(),
            self.ledger.outstanding_len()
        );
        Ok(())
    }

    fn handle_coordinator_read(&mut self) -> Result<()> {
        let alive = self
            .coordinator
            .read_into(&mut self.message_parser)
            .map_err(Error::CoordinatorLost)?;
        if !alive {
            self.terminated = true;
        }
        Ok(())
    }

    fn send_to_coordinator(&mut self, opcode: OpCode, payload: Vec<u8>) {
        let message = Message::new(self.my_id(), opcode, payload);
        self.coordinator.enqueue_write(message.encode());
    }

    // ========================================================================
    // Control plane
    // ========================================================================

    /// Process one control-plane message. Returns false when the message
    /// must be deferred to the next pass (`ConnectionRequest` from a worker
    /// the coordinator has not announced yet).
    pub fn process_message(&mut self, message: &Message) -> Result<bool> {
        match message.opcode {
            OpCode::Hey => {
                let Ok(hey) = Hey::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed Hey payload");
                    return Ok(true);
                };
                log::info!("[CTRL] assigned worker-id={} job={}", hey.worker_id, hey.job_id);
                self.worker_id = Some(hey.worker_id);
                self.job_id = Some(hey.job_id);

                // The coordinator is peer 0, reachable at the same address
                // on both interfaces.
                self.peers.insert(0, &[self.coordinator_addr]);
                let my_id = self.my_id();
                let my_seed = self.my_seed;
                for iface in 0..NUM_INTERFACES {
                    let request = ConnectRequest {
                        worker_id: my_id,
                        my_seed,
                        your_seed: 0,
                        address_no: iface as u32,
                    };
                    let frame =
                        Message::new(my_id, OpCode::ConnectionRequest, request.encode()).encode();
                    self.service_packets.push_front(ServicePacket::new(
                        self.coordinator_addr,
                        0,
                        frame,
                        iface,
                    ));
                }
            }

            OpCode::Ping => {}

            OpCode::GetObjects => {
                let Ok(objects) = GetObjects::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed GetObjects payload");
                    return Ok(true);
                };
                self.get_objects(&objects);
                let samples = self.config.samples_per_pixel;
                if let Err(err) = self.scene.initialize(self.storage.as_ref(), samples) {
                    log::error!("[SCENE] initialization failed: {}", err);
                }
            }

            OpCode::GenerateRays => {
                let Ok(request) = GenerateRays::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed GenerateRays payload");
                    return Ok(true);
                };
                self.generate_rays(request.bounds);
            }

            OpCode::ConnectTo => {
                if let Ok(announce) = ConnectTo::decode(&message.payload) {
                    self.insert_peer(&announce);
                } else {
                    log::warn!("[CTRL] malformed ConnectTo payload");
                }
            }

            OpCode::MultipleConnect => {
                match ConnectTo::decode_many(&message.payload) {
                    Ok(announcements) => {
                        for announce in &announcements {
                            self.insert_peer(announce);
                        }
                    }
                    Err(_) => log::warn!("[CTRL] malformed MultipleConnect payload"),
                }
            }

            OpCode::ConnectionRequest => {
                let Ok(request) = ConnectRequest::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed ConnectionRequest payload");
                    return Ok(true);
                };
                if !self.peers.contains(request.worker_id) {
                    // Not announced by the coordinator yet; retry next pass.
                    return Ok(false);
                }
                let my_id = self.my_id();
                let my_seed = self.my_seed;
                let treelet_ids: Vec<u32> = self.queues.owned_treelets.iter().copied().collect();

                let Some(peer) = self.peers.get_mut(request.worker_id) else {
                    return Ok(true);
                };
                peer.seed = request.my_seed;
                let iface = (request.address_no as usize).min(NUM_INTERFACES - 1);
                let response = ConnectResponse {
                    worker_id: my_id,
                    my_seed,
                    your_seed: peer.seed,
                    address_no: request.address_no,
                    treelet_ids,
                };
                let frame =
                    Message::new(my_id, OpCode::ConnectionResponse, response.encode()).encode();
                let destination = peer.addresses[iface];
                let destination_id = peer.id;
                self.service_packets.push_front(ServicePacket::new(
                    destination,
                    destination_id,
                    frame,
                    iface,
                ));
            }

            OpCode::ConnectionResponse => {
                let Ok(response) = ConnectResponse::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed ConnectionResponse payload");
                    return Ok(true);
                };
                self.process_connection_response(&response);
            }

            OpCode::SendRays => {
                self.receive_rays(message)?;
            }

            OpCode::Bye => {
                log::info!("[CTRL] Bye received, terminating");
                self.terminated = true;
            }

            OpCode::StartBenchmark => {
                let Ok(params) = StartBenchmark::decode(&message.payload) else {
                    log::warn!("[CTRL] malformed StartBenchmark payload");
                    return Ok(true);
                };
                self.init_benchmark(&params);
            }

            other => {
                log::warn!("[CTRL] dropping unexpected {:?} message", other);
            }
        }
        Ok(true)
    }

    fn insert_peer(&mut self, announce: &ConnectTo) {
        if announce.worker_id == self.my_id() || announce.addresses.is_empty() {
            return;
        }
        self.peers.insert(announce.worker_id, &announce.addresses);
    }

    fn process_connection_response(&mut self, response: &ConnectResponse) {
        let my_seed = self.my_seed;
        let Some(peer) = self.peers.get_mut(response.worker_id) else {
            // Unknown worker: nothing to advance, drop it.
            return;
        };
        peer.seed = response.my_seed;

        if peer.state == PeerState::Connected || response.your_seed != my_seed {
            return;
        }
        let iface = response.address_no as usize;
        if !peer.record_connected(iface) {
            return;
        }

        // Handshake complete: absorb the peer's treelet ownership.
        let peer_id = peer.id;
        for treelet_id in &response.treelet_ids {
            peer.treelets.insert(*treelet_id);
        }
        for treelet_id in &response.treelet_ids {
            let promoted = self.queues.announce_treelet(*treelet_id, peer_id);
            self.stats.rays.sending += promoted as u64;
        }
    }

    fn receive_rays(&mut self, message: &Message) -> Result<()> {
        let my_id = self.my_id();
        let track = self.track_rays();
        let max_depth = self.scene.max_depth;
        let mut chunk = crate::protocol::wire::Chunk::new(&message.payload);

        loop {
            let record = match read_record(&mut chunk) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("[CTRL] malformed SendRays payload: {}", err);
                    break;
                }
            };
            match RayState::deserialize(record) {
                Ok(mut ray) => {
                    ray.hop += 1;
                    ray.tick = 0;
                    self.stats.rays.received += 1;
                    if track && ray.track {
                        log_ray_action(my_id, &ray, RayAction::Received, message.sender_id, max_depth);
                    }
                    self.stats.rays.waiting += 1;
                    self.queues.ray_queue.push_back(ray);
                }
                Err(err) => log::warn!("[CTRL] dropping undecodable ray: {}", err),
            }
        }
        Ok(())
    }

    fn get_objects(&mut self, objects: &GetObjects) {
        for key in &objects.keys {
            match key.kind {
                // Triangle meshes are packed inside treelets.
                ObjectKind::TriangleMesh => continue,
                ObjectKind::Treelet => {
                    self.queues.owned_treelets.insert(key.id as u32);
                }
                _ => {}
            }
            if let Err(err) = self.storage.get(&key.to_path()) {
                log::warn!("[STORAGE] fetch failed for {}: {}", key.to_path(), err);
            }
        }
        log::info!(
            "[CTRL] owning {} treelets after GetObjects",
            self.queues.owned_treelets.len()
        );
    }

    /// Iterate pixels x samples over the crop window and classify each
    /// starting ray.
    pub fn generate_rays(&mut self, bounds: crate::protocol::records::Bounds2i) {
        if !self.scene.is_initialized() {
            log::warn!("[CTRL] GenerateRays before scene initialization, ignoring");
            return;
        }
        let my_id = self.my_id();
        let track = self.track_rays();
        let max_depth = self.scene.max_depth;
        let sample_bounds = self.scene.sample_bounds;

        for sample in 0..self.scene.samples_per_pixel {
            for y in bounds.y_min..bounds.y_max {
                for x in bounds.x_min..bounds.x_max {
                    if !sample_bounds.contains(x, y) {
                        continue;
                    }
                    let mut ray = self.scene.starting_ray((x, y), sample);
                    ray.track = track && self.ray_log_dist.sample(&mut self.rng);
                    if track && ray.track {
                        log_ray_action(my_id, &ray, RayAction::Generated, my_id, max_depth);
                    }
                    self.classify_processed(ray);
                }
            }
        }
    }

    // ========================================================================
    // Benchmark mode
    // ========================================================================

    fn init_benchmark(&mut self, params: &StartBenchmark) {
        let Some(peer) = self.peers.get(params.destination as WorkerId) else {
            log::warn!(
                "[BENCH] unknown destination worker {}, ignoring",
                params.destination
            );
            return;
        };
        let destination_id = peer.id;
        let destination_addrs = peer.addresses;

        // Everything except the control channel goes quiet.
        for (event, id) in &self.actions {
            match event {
                Event::CoordinatorRead | Event::CoordinatorFlush | Event::Messages => {}
                _ => self.reactor.deactivate(*id),
            }
        }
        self.udp[0].reset_reference();
        self.udp[1].reset_reference();

        let send_iface = (params.address_no as usize).min(NUM_INTERFACES - 1);
        let recv_iface = 1 - send_iface;
        if params.rate_mbps > 0 {
            self.udp[recv_iface].set_rate(params.rate_mbps as u64);
        }

        let frame = Message::new(
            self.my_id(),
            OpCode::Ping,
            vec![b'x'; BENCHMARK_PAYLOAD_BYTES],
        )
        .encode();
        let mut bench = BenchmarkData::new(destination_id, send_iface, frame);
        bench.destination_addrs = destination_addrs;
        self.benchmark = Some(bench);

        log::info!(
            "[BENCH] starting: dest={} duration={}s rate={}Mbps send_iface={}",
            params.destination,
            params.duration_secs,
            params.rate_mbps,
            send_iface
        );

        let table = [
            (Event::BenchReceive(0), Trigger::Readable(TOKEN_UDP0)),
            (Event::BenchReceive(1), Trigger::Readable(TOKEN_UDP1)),
            (Event::BenchSend(0), Trigger::Ready),
            (Event::BenchSend(1), Trigger::Ready),
            (
                Event::BenchCheckpoint,
                Trigger::Every(BENCHMARK_CHECKPOINT_INTERVAL),
            ),
            (
                Event::BenchStop,
                Trigger::Every(Duration::from_secs(params.duration_secs.max(1) as u64)),
            ),
        ];
        for (event, trigger) in table {
            let id = self.reactor.register(event, trigger);
            self.actions.insert(event, id);
        }
    }

    fn handle_bench_send(&mut self, iface: usize) -> Result<()> {
        let Some(bench) = self.benchmark.as_mut() else {
            return Ok(());
        };
        let destination = bench.destination_addrs[iface];
        let sent = self.udp[iface]
            .send_to(&bench.frame, destination)
            .map_err(Error::Transport)?;
        if iface == bench.send_iface {
            bench.checkpoint.bytes_sent += sent as u64;
            bench.checkpoint.packets_sent += 1;
        }
        Ok(())
    }

    fn handle_bench_receive(&mut self, iface: usize) -> Result<()> {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let received = self.udp[iface]
                .recv_from(&mut buf)
                .map_err(Error::Transport)?;
            let Some((_, len)) = received else {
                break;
            };
            if let Some(bench) = self.benchmark.as_mut() {
                if iface == bench.recv_iface {
                    bench.checkpoint.bytes_received += len as u64;
                    bench.checkpoint.packets_received += 1;
                }
            }
        }
        Ok(())
    }

    fn handle_bench_stop(&mut self) -> Result<()> {
        if let Some(bench) = self.benchmark.as_mut() {
            bench.finish();
        }
        self.reactor.deactivate_all();
        self.terminated = true;
        Ok(())
    }

    /// Flush benchmark results to the log and upload the worker log to the
    /// storage backend. Called after the loop exits.
    pub fn upload_logs(&mut self) {
        if let Some(bench) = &self.benchmark {
            log::info!(
                target: "bench",
                "start 0 end {}",
                bench
                    .ended
                    .map(|end| end.duration_since(bench.started).as_millis())
                    .unwrap_or(0)
            );
            bench.log_summary();
        }

        let (Some(worker_id), Some(job_id)) = (self.worker_id, self.job_id.as_deref()) else {
            return;
        };
        let mut summary = String::new();
        summary.push_str(&format!("worker {} job {}\n", worker_id, job_id));
        if let Some(bench) = &self.benchmark {
            summary.push_str(&format!(
                "bench totals: sent={}B/{}pkts received={}B/{}pkts\n",
                bench.totals.bytes_sent,
                bench.totals.packets_sent,
                bench.totals.bytes_received,
                bench.totals.packets_received
            ));
        }
        let key = format!("logs/{}/{}.INFO", job_id, worker_id);
        if let Err(err) = self.storage.put(&key, summary.as_bytes()) {
            log::warn!("[STORAGE] log upload failed: {}", err);
        }
    }
}
