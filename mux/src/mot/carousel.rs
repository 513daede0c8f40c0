//! Directory-backed MOT carousel: content files plus YAML sidecars, a
//! generated directory object, priority-scheduled packet emission and
//! polling-based hot reload.
//!
//! A rebuild swaps the whole serving schedule at once, so packet
//! emission never observes a half-built carousel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use failure::{bail, Error};
use log::{info, warn};
use serde::Serialize;

use super::datagroup::{segment_object, DEFAULT_MAX_SEGMENT};
use super::directory::{build_directory, DIRECTORY_TRANSPORT_ID};
use super::object::MotObject;
use super::packet::MscPacketizer;

/// Content extensions the scanner picks up.
const CONTENT_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "dat"];
/// Directory re-scan cadence for hot reload.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Serialize)]
pub struct CarouselStats {
    pub num_objects: usize,
    pub packets_transmitted: u64,
    pub total_bytes: u64,
    pub reloads: u64,
}

/// Pre-encoded packets of one object.
struct ScheduledObject {
    transport_id: u16,
    priority: u8,
    packets: Vec<Vec<u8>>,
}

pub struct Carousel {
    directory: PathBuf,
    address: u16,
    max_packet_size: usize,
    objects: Vec<ScheduledObject>,
    /// (object index, packet index) serving order for one full cycle.
    cycle: Vec<(usize, usize)>,
    cycle_pos: usize,
    signature: Vec<(PathBuf, SystemTime, u64)>,
    last_scan: Instant,
    poll_interval: Duration,
    packets_transmitted: u64,
    bytes_transmitted: u64,
    reloads: u64,
}

impl Carousel {
    pub fn new(directory: &Path, address: u16, max_packet_size: usize) -> Result<Self, Error> {
        if !directory.is_dir() {
            bail!("carousel directory {:?} not found", directory);
        }
        let mut carousel = Carousel {
            directory: directory.to_owned(),
            address,
            max_packet_size,
            objects: Vec::new(),
            cycle: Vec::new(),
            cycle_pos: 0,
            signature: Vec::new(),
            last_scan: Instant::now(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            packets_transmitted: 0,
            bytes_transmitted: 0,
            reloads: 0,
        };
        carousel.reload()?;
        Ok(carousel)
    }

    pub fn stats(&self) -> CarouselStats {
        CarouselStats {
            // The generated directory object is not counted.
            num_objects: self.objects.len().saturating_sub(1),
            packets_transmitted: self.packets_transmitted,
            total_bytes: self.bytes_transmitted,
            reloads: self.reloads,
        }
    }

    /// Scans the directory and rebuilds the serving schedule.
    pub fn reload(&mut self) -> Result<usize, Error> {
        let mut content: BTreeMap<PathBuf, ()> = BTreeMap::new();
        let mut signature = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                signature.push((
                    path.clone(),
                    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    meta.len(),
                ));
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if CONTENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                content.insert(path, ());
            }
        }
        signature.sort();

        let mut loaded: Vec<MotObject> = Vec::new();
        let mut next_tid = 1u16;
        for path in content.keys() {
            match MotObject::from_file(path, next_tid) {
                Ok(obj) => {
                    if !obj.enabled {
                        continue;
                    }
                    if obj.transport_id == DIRECTORY_TRANSPORT_ID
                        || loaded.iter().any(|o| o.transport_id == obj.transport_id)
                    {
                        warn!(
                            "carousel {:?}: transport id {} clash on {:?}, skipped",
                            self.directory, obj.transport_id, path
                        );
                        continue;
                    }
                    next_tid = next_tid.max(obj.transport_id + 1);
                    loaded.push(obj);
                }
                Err(e) => warn!("carousel object {:?} skipped: {}", path, e),
            }
        }

        let directory_object = build_directory(&loaded.iter().collect::<Vec<_>>());
        let mut all = Vec::with_capacity(loaded.len() + 1);
        all.push(directory_object);
        all.extend(loaded);

        let mut packetizer = MscPacketizer::new(self.address, self.max_packet_size);
        let objects: Vec<ScheduledObject> = all
            .iter()
            .map(|obj| {
                let mut packets = Vec::new();
                for group in segment_object(obj, DEFAULT_MAX_SEGMENT) {
                    for packet in packetizer.packetize(&group.encode()) {
                        packets.push(packet.encode());
                    }
                }
                ScheduledObject {
                    transport_id: obj.transport_id,
                    priority: obj.priority,
                    packets,
                }
            })
            .collect();

        let cycle = build_cycle(&objects);
        info!(
            "carousel {:?}: {} object(s), {} packet(s) per cycle",
            self.directory,
            objects.len().saturating_sub(1),
            cycle.len()
        );
        self.objects = objects;
        self.cycle = cycle;
        self.cycle_pos = 0;
        self.signature = signature;
        self.reloads += 1;
        Ok(self.objects.len().saturating_sub(1))
    }

    /// Rescans when the poll interval elapsed and the directory changed.
    /// Returns true after a rebuild.
    pub fn poll_reload(&mut self) -> bool {
        if self.last_scan.elapsed() < self.poll_interval {
            return false;
        }
        self.last_scan = Instant::now();
        let mut signature = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    signature.push((
                        path,
                        meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                        meta.len(),
                    ));
                }
            }
        }
        signature.sort();
        if signature != self.signature {
            match self.reload() {
                Ok(n) => {
                    info!("carousel {:?} reloaded: {} object(s)", self.directory, n);
                    return true;
                }
                Err(e) => warn!("carousel {:?} reload failed: {}", self.directory, e),
            }
        }
        false
    }

    /// The next packet of the serving cycle, or None for an empty
    /// carousel.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        if self.cycle.is_empty() {
            return None;
        }
        let (obj, pkt) = self.cycle[self.cycle_pos];
        self.cycle_pos = (self.cycle_pos + 1) % self.cycle.len();
        let bytes = self.objects[obj].packets[pkt].clone();
        self.packets_transmitted += 1;
        self.bytes_transmitted += bytes.len() as u64;
        Some(bytes)
    }

    /// Fills a subchannel frame with whole packets, zero padding the
    /// tail.
    pub fn fill_frame(&mut self, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let remaining = size - out.len();
            let next_len = match self.peek_packet_len() {
                Some(l) => l,
                None => break,
            };
            if next_len > remaining {
                break;
            }
            match self.next_packet() {
                Some(p) => out.extend_from_slice(&p),
                None => break,
            }
        }
        out.resize(size, 0);
        out
    }

    fn peek_packet_len(&self) -> Option<usize> {
        if self.cycle.is_empty() {
            return None;
        }
        let (obj, pkt) = self.cycle[self.cycle_pos];
        Some(self.objects[obj].packets[pkt].len())
    }

    pub fn object_ids(&self) -> Vec<u16> {
        self.objects.iter().map(|o| o.transport_id).collect()
    }
}

/// One serving cycle: the directory object first, then strict priority
/// 8 down to 1, round-robin across the objects within each level.
fn build_cycle(objects: &[ScheduledObject]) -> Vec<(usize, usize)> {
    let mut cycle = Vec::new();
    if let Some(dir) = objects
        .iter()
        .position(|o| o.transport_id == DIRECTORY_TRANSPORT_ID)
    {
        for pkt in 0..objects[dir].packets.len() {
            cycle.push((dir, pkt));
        }
    }
    for priority in (1..=8u8).rev() {
        let level: Vec<usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.priority == priority && o.transport_id != DIRECTORY_TRANSPORT_ID)
            .map(|(i, _)| i)
            .collect();
        if level.is_empty() {
            continue;
        }
        let mut cursors = vec![0usize; level.len()];
        loop {
            let mut emitted = false;
            for (slot, &obj) in level.iter().enumerate() {
                if cursors[slot] < objects[obj].packets.len() {
                    cycle.push((obj, cursors[slot]));
                    cursors[slot] += 1;
                    emitted = true;
                }
            }
            if !emitted {
                break;
            }
        }
    }
    cycle
}
