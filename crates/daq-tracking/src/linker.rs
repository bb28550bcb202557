//! Trajectory store.
//!
//! Keeps the last `history_depth` positions of up to `max_particles`
//! particles, keyed by particle id. A trajectory ends once its newest point
//! falls out of the history window; when the store is full the particle
//! seen least recently makes room for a new one.

use daq_core::trajectory::{Particle, ParticleState, Trajectories, Trajectory, TrajectoryPoint};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

#[derive(Debug, Clone)]
struct History {
    roi_nr: u16,
    lifetime: u32,
    last_frame: u32,
    points: VecDeque<TrajectoryPoint>,
}

#[derive(Debug)]
pub struct ParticleLinker {
    max_particles: usize,
    history_depth: usize,
    histories: BTreeMap<u32, History>,
}

impl ParticleLinker {
    #[must_use]
    pub fn new(max_particles: u32, history_depth: u16) -> Self {
        Self {
            max_particles: (max_particles as usize).max(1),
            history_depth: usize::from(history_depth.max(1)),
            histories: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn max_particles(&self) -> usize {
        self.max_particles
    }

    #[must_use]
    pub fn history_depth(&self) -> usize {
        self.history_depth
    }

    /// Append this frame's particles to their histories.
    pub fn add_particles(&mut self, frame_nr: u32, particles: &[Particle]) {
        let depth = self.history_depth as u32;
        self.histories
            .retain(|_, h| frame_nr.saturating_sub(h.last_frame) < depth);

        for p in particles {
            if p.state == ParticleState::Gone {
                self.histories.remove(&p.id);
                continue;
            }
            if !self.histories.contains_key(&p.id) && self.histories.len() >= self.max_particles {
                self.evict_oldest();
            }
            let history = self.histories.entry(p.id).or_insert_with(|| History {
                roi_nr: p.event.roi_nr,
                lifetime: 0,
                last_frame: frame_nr,
                points: VecDeque::with_capacity(self.history_depth),
            });
            history.roi_nr = p.event.roi_nr;
            history.lifetime = p.lifetime;
            history.last_frame = frame_nr;
            if history.points.back().is_some_and(|pt| pt.frame_nr == frame_nr) {
                history.points.pop_back();
            }
            history.points.push_back(TrajectoryPoint {
                frame_nr,
                x: p.event.center_x,
                y: p.event.center_y,
            });
            while history.points.len() > self.history_depth {
                history.points.pop_front();
            }
        }
        trace!(frame_nr, live = self.histories.len(), "Linked particles");
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .histories
            .iter()
            .min_by_key(|(id, h)| (h.last_frame, **id))
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.histories.remove(&id);
        }
    }

    /// Snapshot of every live trajectory, ordered by particle id.
    #[must_use]
    pub fn trajectories(&self) -> Trajectories {
        let mut set = Trajectories::new(self.max_particles as u32, self.history_depth as u32);
        set.trajectories = self
            .histories
            .iter()
            .map(|(id, h)| Trajectory {
                roi_nr: h.roi_nr,
                particle_id: *id,
                lifetime: h.lifetime,
                points: h.points.iter().copied().collect(),
            })
            .collect();
        set
    }

    pub fn clear(&mut self) {
        self.histories.clear();
    }
}
