//! Particle tracking backends.
//!
//! A [`ParticleTracker`] turns one frame's centroid events into particles
//! with identities that stay stable across frames. Backends hold per-run
//! state and are not shared between threads; the pipeline creates one per
//! run through a [`TrackerFactory`] and confines it to the disk stage.

use daq_core::settings::TrackingSettings;
use daq_core::trajectory::{Particle, ParticleEvent, ParticleState};
use daq_core::AcqResult;
use tracing::debug;

pub trait ParticleTracker: Send {
    /// Assign ids to `events`, linking them to particles seen in earlier
    /// frames. The result has one particle per event, in event order.
    fn track(&mut self, frame_nr: u32, events: &[ParticleEvent]) -> AcqResult<Vec<Particle>>;

    /// Record particles whose ids were supplied by the camera, so a later
    /// relink continues from their positions.
    fn observe(&mut self, _frame_nr: u32, _particles: &[Particle]) {}

    /// Forget all particles.
    fn reset(&mut self);
}

/// Builds a tracker for one run.
pub trait TrackerFactory: Send + Sync {
    fn create(&self, settings: &TrackingSettings) -> AcqResult<Box<dyn ParticleTracker>>;
}

// =============================================================================
// Nearest-neighbour backend
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Tracked {
    id: u32,
    x: f64,
    y: f64,
    last_frame: u32,
    lifetime: u32,
}

/// Greedy nearest-neighbour linker.
///
/// Pairs each event with the closest live particle within `max_distance`
/// pixels, closest pairs first. Unmatched events start new particles with
/// ids counting up from 1. A particle not matched for more than
/// `link_frames` frames is dropped.
#[derive(Debug)]
pub struct NearestNeighbourTracker {
    max_distance: f64,
    link_frames: u32,
    next_id: u32,
    live: Vec<Tracked>,
}

impl NearestNeighbourTracker {
    #[must_use]
    pub fn new(max_distance: u16, link_frames: u16) -> Self {
        Self {
            max_distance: f64::from(max_distance),
            link_frames: u32::from(link_frames.max(1)),
            next_id: 1,
            live: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &TrackingSettings) -> Self {
        Self::new(settings.max_distance, settings.link_frames)
    }

    /// Particles currently eligible for linking.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn expire(&mut self, frame_nr: u32) {
        let link_frames = self.link_frames;
        self.live
            .retain(|t| frame_nr.saturating_sub(t.last_frame) <= link_frames);
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }
}

impl ParticleTracker for NearestNeighbourTracker {
    fn track(&mut self, frame_nr: u32, events: &[ParticleEvent]) -> AcqResult<Vec<Particle>> {
        self.expire(frame_nr);

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (ei, ev) in events.iter().enumerate() {
            for (ti, t) in self.live.iter().enumerate() {
                let d = (f64::from(ev.center_x) - t.x).hypot(f64::from(ev.center_y) - t.y);
                if d <= self.max_distance {
                    pairs.push((d, ei, ti));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut event_match: Vec<Option<usize>> = vec![None; events.len()];
        let mut taken = vec![false; self.live.len()];
        for (_, ei, ti) in pairs {
            if event_match[ei].is_none() && !taken[ti] {
                event_match[ei] = Some(ti);
                taken[ti] = true;
            }
        }

        let mut particles = Vec::with_capacity(events.len());
        for (ev, matched) in events.iter().zip(event_match) {
            let particle = match matched {
                Some(ti) => {
                    let t = &mut self.live[ti];
                    t.x = f64::from(ev.center_x);
                    t.y = f64::from(ev.center_y);
                    t.last_frame = frame_nr;
                    t.lifetime += 1;
                    Particle {
                        id: t.id,
                        event: *ev,
                        lifetime: t.lifetime,
                        state: ParticleState::Continuation,
                    }
                }
                None => {
                    let id = self.allocate_id();
                    self.live.push(Tracked {
                        id,
                        x: f64::from(ev.center_x),
                        y: f64::from(ev.center_y),
                        last_frame: frame_nr,
                        lifetime: 1,
                    });
                    Particle {
                        id,
                        event: *ev,
                        lifetime: 1,
                        state: ParticleState::New,
                    }
                }
            };
            particles.push(particle);
        }
        Ok(particles)
    }

    fn observe(&mut self, frame_nr: u32, particles: &[Particle]) {
        self.expire(frame_nr);
        for p in particles {
            let (x, y) = (f64::from(p.event.center_x), f64::from(p.event.center_y));
            match self.live.iter_mut().find(|t| t.id == p.id) {
                Some(t) => {
                    t.x = x;
                    t.y = y;
                    t.last_frame = frame_nr;
                    t.lifetime = t.lifetime.max(p.lifetime);
                }
                None => self.live.push(Tracked {
                    id: p.id,
                    x,
                    y,
                    last_frame: frame_nr,
                    lifetime: p.lifetime,
                }),
            }
            if p.id >= self.next_id {
                self.next_id = p.id.wrapping_add(1).max(1);
            }
        }
    }

    fn reset(&mut self) {
        self.live.clear();
        self.next_id = 1;
    }
}

/// Factory for [`NearestNeighbourTracker`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestNeighbourFactory;

impl TrackerFactory for NearestNeighbourFactory {
    fn create(&self, settings: &TrackingSettings) -> AcqResult<Box<dyn ParticleTracker>> {
        if !settings.cpu_only {
            debug!("Nearest-neighbour tracker has no GPU path, running on CPU");
        }
        Ok(Box::new(NearestNeighbourTracker::from_settings(settings)))
    }
}
