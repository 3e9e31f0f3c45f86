use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

use wildmesh_core::{Destination, NodeId};

/// A frame handed up by the radio, with link metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub bytes: Vec<u8>,
    /// 0.0 (unusable) to 1.0 (perfect).
    pub signal_quality: f32,
    pub hop_count: u8,
}

/// The radio seen from the engine: best-effort, small frames, no guarantees.
pub trait LinkTransport {
    /// Queue a frame for the air. `false` means the radio refused it.
    fn send(&mut self, destination: Destination, frame: &[u8]) -> bool;

    /// Next buffered inbound frame, if any.
    fn receive(&mut self) -> Option<InboundFrame>;

    fn max_frame_size(&self) -> usize;
}

impl<T: LinkTransport + ?Sized> LinkTransport for Box<T> {
    fn send(&mut self, destination: Destination, frame: &[u8]) -> bool {
        (**self).send(destination, frame)
    }

    fn receive(&mut self) -> Option<InboundFrame> {
        (**self).receive()
    }

    fn max_frame_size(&self) -> usize {
        (**self).max_frame_size()
    }
}

// ── Simulated radio ────────────────────────────────────────────

/// A frame as it crosses the simulated medium, shown to drop filters.
#[derive(Debug, Clone, Copy)]
pub struct RadioFrame<'a> {
    pub from: NodeId,
    pub to: NodeId,
    pub bytes: &'a [u8],
}

type DropFilter = Box<dyn FnMut(&RadioFrame<'_>) -> bool + Send>;

struct Station {
    inbox: VecDeque<InboundFrame>,
    online: bool,
    /// Quality receivers see on frames from this station.
    signal_quality: f32,
}

struct Medium {
    stations: BTreeMap<NodeId, Station>,
    rng: StdRng,
    loss_rate: f64,
    max_frame: usize,
    drop_filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

/// In-process shared medium. Every node gets a [`RadioPort`]; frames are
/// delivered to the inboxes of the addressed stations, subject to seeded
/// random loss, per-station offline switches, and an optional drop filter.
#[derive(Clone)]
pub struct SimulatedRadio {
    medium: Arc<Mutex<Medium>>,
}

impl SimulatedRadio {
    pub fn new(max_frame: usize, loss_rate: f64, seed: u64) -> Self {
        Self {
            medium: Arc::new(Mutex::new(Medium {
                stations: BTreeMap::new(),
                rng: StdRng::seed_from_u64(seed),
                loss_rate: loss_rate.clamp(0.0, 1.0),
                max_frame,
                drop_filter: None,
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    /// Attach a station and return its port.
    pub fn port(&self, node: NodeId) -> RadioPort {
        self.medium.lock().stations.entry(node).or_insert(Station {
            inbox: VecDeque::new(),
            online: true,
            signal_quality: 1.0,
        });
        RadioPort {
            node,
            medium: Arc::clone(&self.medium),
        }
    }

    /// An offline station neither sends nor hears anything.
    pub fn set_online(&self, node: NodeId, online: bool) {
        let mut medium = self.medium.lock();
        if let Some(station) = medium.stations.get_mut(&node) {
            station.online = online;
            if !online {
                station.inbox.clear();
            }
        }
    }

    pub fn is_online(&self, node: NodeId) -> bool {
        self.medium
            .lock()
            .stations
            .get(&node)
            .is_some_and(|s| s.online)
    }

    pub fn set_signal_quality(&self, node: NodeId, quality: f32) {
        if let Some(station) = self.medium.lock().stations.get_mut(&node) {
            station.signal_quality = quality.clamp(0.0, 1.0);
        }
    }

    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.medium.lock().loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// Drop every frame for which `filter` returns `true`.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&RadioFrame<'_>) -> bool + Send + 'static,
    {
        self.medium.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.medium.lock().drop_filter = None;
    }

    pub fn frames_delivered(&self) -> u64 {
        self.medium.lock().delivered
    }

    pub fn frames_dropped(&self) -> u64 {
        self.medium.lock().dropped
    }
}

impl Medium {
    fn transmit(&mut self, from: NodeId, destination: Destination, bytes: &[u8]) -> bool {
        if bytes.len() > self.max_frame {
            return false;
        }
        let Some(sender) = self.stations.get(&from) else {
            return false;
        };
        if !sender.online {
            return false;
        }
        let quality = sender.signal_quality;

        let targets: Vec<NodeId> = match destination {
            Destination::Broadcast => self
                .stations
                .keys()
                .copied()
                .filter(|id| *id != from)
                .collect(),
            Destination::Node(to) => vec![to],
        };

        for to in targets {
            let online = self.stations.get(&to).is_some_and(|s| s.online);
            let filtered = self
                .drop_filter
                .as_mut()
                .is_some_and(|f| f(&RadioFrame { from, to, bytes }));
            let lost = self.rng.gen_bool(self.loss_rate);
            if !online || filtered || lost {
                trace!(%from, %to, filtered, lost, "frame dropped");
                self.dropped += 1;
                continue;
            }
            if let Some(station) = self.stations.get_mut(&to) {
                station.inbox.push_back(InboundFrame {
                    bytes: bytes.to_vec(),
                    signal_quality: quality,
                    hop_count: 1,
                });
                self.delivered += 1;
            }
        }
        true
    }
}

/// One station's handle onto a [`SimulatedRadio`].
pub struct RadioPort {
    node: NodeId,
    medium: Arc<Mutex<Medium>>,
}

impl RadioPort {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl LinkTransport for RadioPort {
    fn send(&mut self, destination: Destination, frame: &[u8]) -> bool {
        self.medium.lock().transmit(self.node, destination, frame)
    }

    fn receive(&mut self) -> Option<InboundFrame> {
        let mut medium = self.medium.lock();
        let station = medium.stations.get_mut(&self.node)?;
        if !station.online {
            return None;
        }
        station.inbox.pop_front()
    }

    fn max_frame_size(&self) -> usize {
        self.medium.lock().max_frame
    }
}
