// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane payload records.
//!
//! Coordinator RPC payloads are fixed-layout big-endian records. Sequences
//! of variable-size records (rays, finished rays, connect announcements)
//! are framed with a 4-byte big-endian length prefix per record.

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::protocol::wire::{
    put_f32, put_i32, put_string, put_u32, put_u64, put_u8, Chunk,
};

/// Append one length-prefixed record to a payload buffer.
pub fn put_record(buf: &mut Vec<u8>, record: &[u8]) {
    put_u32(buf, record.len() as u32);
    buf.extend_from_slice(record);
}

/// Read one length-prefixed record, or `None` at end of payload.
pub fn read_record<'a>(chunk: &mut Chunk<'a>) -> Result<Option<&'a [u8]>> {
    if chunk.is_empty() {
        return Ok(None);
    }
    let len = chunk.u32()? as usize;
    Ok(Some(chunk.bytes(len)?))
}

/// Kinds of serialized scene objects the coordinator may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Treelet = 0,
    TriangleMesh = 1,
    Camera = 2,
    Sampler = 3,
    Lights = 4,
    Scene = 5,
}

impl ObjectKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ObjectKind::Treelet),
            1 => Ok(ObjectKind::TriangleMesh),
            2 => Ok(ObjectKind::Camera),
            3 => Ok(ObjectKind::Sampler),
            4 => Ok(ObjectKind::Lights),
            5 => Ok(ObjectKind::Scene),
            _ => Err(Error::Protocol("unknown object kind")),
        }
    }
}

/// Key of a serialized scene object in the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub id: u64,
}

impl ObjectKey {
    /// Storage path of this object.
    pub fn to_path(self) -> String {
        match self.kind {
            ObjectKind::Treelet => format!("T{}", self.id),
            ObjectKind::TriangleMesh => format!("TM{}", self.id),
            ObjectKind::Camera => "CAMERA".to_string(),
            ObjectKind::Sampler => "SAMPLER".to_string(),
            ObjectKind::Lights => "LIGHTS".to_string(),
            ObjectKind::Scene => "SCENE".to_string(),
        }
    }
}

/// `Hey` reply: identity assignment from the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hey {
    pub worker_id: u64,
    pub job_id: String,
}

impl Hey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.worker_id);
        put_string(&mut buf, &self.job_id);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            worker_id: chunk.u64()?,
            job_id: chunk.string()?,
        })
    }
}

/// `GetObjects`: the set of objects this worker must fetch and own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjects {
    pub keys: Vec<ObjectKey>,
}

impl GetObjects {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.keys.len() as u32);
        for key in &self.keys {
            put_u8(&mut buf, key.kind as u8);
            put_u64(&mut buf, key.id);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        let count = chunk.u32()? as usize;
        let mut keys = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            keys.push(ObjectKey {
                kind: ObjectKind::from_u8(chunk.u8()?)?,
                id: chunk.u64()?,
            });
        }
        Ok(Self { keys })
    }
}

/// Inclusive-exclusive pixel rectangle, as the coordinator partitions film.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds2i {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl Bounds2i {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x_min && x < self.x_max && y >= self.y_min && y < self.y_max
    }
}

/// `GenerateRays`: trace camera rays for a crop window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateRays {
    pub bounds: Bounds2i,
}

impl GenerateRays {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_i32(&mut buf, self.bounds.x_min);
        put_i32(&mut buf, self.bounds.y_min);
        put_i32(&mut buf, self.bounds.x_max);
        put_i32(&mut buf, self.bounds.y_max);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            bounds: Bounds2i {
                x_min: chunk.i32()?,
                y_min: chunk.i32()?,
                x_max: chunk.i32()?,
                y_max: chunk.i32()?,
            },
        })
    }
}

/// `ConnectTo`: a peer announcement with one address per interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTo {
    pub worker_id: u64,
    pub addresses: Vec<SocketAddr>,
}

impl ConnectTo {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.worker_id);
        put_u32(&mut buf, self.addresses.len().min(2) as u32);
        for addr in self.addresses.iter().take(2) {
            put_string(&mut buf, &addr.to_string());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Self::decode_from(&mut chunk)
    }

    fn decode_from(chunk: &mut Chunk<'_>) -> Result<Self> {
        let worker_id = chunk.u64()?;
        let count = chunk.u32()? as usize;
        if count > 2 {
            return Err(Error::Protocol("too many peer addresses"));
        }
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let text = chunk.string()?;
            addresses.push(
                text.parse()
                    .map_err(|_| Error::Protocol("invalid peer address"))?,
            );
        }
        Ok(Self {
            worker_id,
            addresses,
        })
    }

    /// Decode a `MultipleConnect` payload: length-prefixed `ConnectTo`
    /// records back to back.
    pub fn decode_many(payload: &[u8]) -> Result<Vec<Self>> {
        let mut chunk = Chunk::new(payload);
        let mut announcements = Vec::new();
        while let Some(record) = read_record(&mut chunk)? {
            announcements.push(Self::decode(record)?);
        }
        Ok(announcements)
    }

    pub fn encode_many(items: &[Self]) -> Vec<u8> {
        let mut buf = Vec::new();
        for item in items {
            put_record(&mut buf, &item.encode());
        }
        buf
    }
}

/// Dual-interface handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub worker_id: u64,
    pub my_seed: u32,
    pub your_seed: u32,
    pub address_no: u32,
}

impl ConnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.worker_id);
        put_u32(&mut buf, self.my_seed);
        put_u32(&mut buf, self.your_seed);
        put_u32(&mut buf, self.address_no);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            worker_id: chunk.u64()?,
            my_seed: chunk.u32()?,
            your_seed: chunk.u32()?,
            address_no: chunk.u32()?,
        })
    }
}

/// Handshake response; carries the responder's owned treelets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub worker_id: u64,
    pub my_seed: u32,
    pub your_seed: u32,
    pub address_no: u32,
    pub treelet_ids: Vec<u32>,
}

impl ConnectResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.worker_id);
        put_u32(&mut buf, self.my_seed);
        put_u32(&mut buf, self.your_seed);
        put_u32(&mut buf, self.address_no);
        put_u32(&mut buf, self.treelet_ids.len() as u32);
        for id in &self.treelet_ids {
            put_u32(&mut buf, *id);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        let worker_id = chunk.u64()?;
        let my_seed = chunk.u32()?;
        let your_seed = chunk.u32()?;
        let address_no = chunk.u32()?;
        let count = chunk.u32()? as usize;
        let mut treelet_ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            treelet_ids.push(chunk.u32()?);
        }
        Ok(Self {
            worker_id,
            my_seed,
            your_seed,
            address_no,
            treelet_ids,
        })
    }
}

/// `GetWorker`: ask the coordinator who owns a treelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetWorker {
    pub treelet_id: u32,
}

impl GetWorker {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.treelet_id);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            treelet_id: chunk.u32()?,
        })
    }
}

/// `StartBenchmark`: four 32-bit big-endian fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBenchmark {
    pub destination: u32,
    pub duration_secs: u32,
    pub rate_mbps: u32,
    pub address_no: u32,
}

impl StartBenchmark {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.destination);
        put_u32(&mut buf, self.duration_secs);
        put_u32(&mut buf, self.rate_mbps);
        put_u32(&mut buf, self.address_no);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(payload);
        Ok(Self {
            destination: chunk.u32()?,
            duration_secs: chunk.u32()?,
            rate_mbps: chunk.u32()?,
            address_no: chunk.u32()?,
        })
    }
}

/// One completed sample contribution, sent back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRay {
    pub sample_id: u64,
    pub p_film: (f32, f32),
    pub weight: f32,
    pub l: [f32; 3],
}

impl FinishedRay {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.sample_id);
        put_f32(&mut buf, self.p_film.0);
        put_f32(&mut buf, self.p_film.1);
        put_f32(&mut buf, self.weight);
        for c in self.l {
            put_f32(&mut buf, c);
        }
        buf
    }

    pub fn decode(record: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(record);
        Ok(Self {
            sample_id: chunk.u64()?,
            p_film: (chunk.f32()?, chunk.f32()?),
            weight: chunk.f32()?,
            l: [chunk.f32()?, chunk.f32()?, chunk.f32()?],
        })
    }
}
