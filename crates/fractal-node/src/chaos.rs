//! Chaos-game point generation for one cluster member.
//!
//! The attractor of a job is the set of points reached by repeatedly moving
//! `ratio` of the way toward a randomly chosen anchor. A member with fractal
//! address `d1 d2 .. dk` only draws the part of the attractor that the
//! contractions `f_d1 ∘ f_d2 ∘ .. ∘ f_dk` map it onto, so members with
//! different addresses cover different regions. The genesis address `"0"`
//! draws the whole attractor.

use std::sync::Arc;
use std::time::Duration;

use fractal_protocol::{Job, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ComputeConfig;
use crate::error::{Error, Result};

/// Address of the member that seeded a cluster.
pub const GENESIS_ADDRESS: &str = "0";

/// Shortest compute tick; `tokio::time::interval` panics on zero.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Deterministic point generator for `(job, fractal address)`.
#[derive(Debug)]
pub struct ChaosGame {
    anchors: Vec<(f64, f64)>,
    ratio: f64,
    path: Vec<usize>,
    width: f64,
    height: f64,
    current: (f64, f64),
    rng: StdRng,
}

impl ChaosGame {
    pub fn new(job: &Job, fractal_id: &str) -> Result<Self> {
        if job.anchors.len() < 2 {
            return Err(Error::InvalidJob(format!(
                "{} needs at least two anchors",
                job.name
            )));
        }
        if !(job.ratio > 0.0 && job.ratio < 1.0) {
            return Err(Error::InvalidJob(format!(
                "{} has ratio {} outside (0, 1)",
                job.name, job.ratio
            )));
        }

        let path = if fractal_id == GENESIS_ADDRESS {
            Vec::new()
        } else {
            fractal_id
                .chars()
                .map(|c| match c.to_digit(10) {
                    Some(d) if (d as usize) < job.anchors.len() => Ok(d as usize),
                    _ => Err(Error::InvalidJob(format!(
                        "address {fractal_id:?} does not fit {} anchors",
                        job.anchors.len()
                    ))),
                })
                .collect::<Result<Vec<_>>>()?
        };

        let anchors: Vec<(f64, f64)> = job
            .anchors
            .iter()
            .map(|p| (p.x as f64, p.y as f64))
            .collect();

        let seed = blake3::hash(format!("{}:{}", job.name, fractal_id).as_bytes());

        Ok(Self {
            current: anchors[0],
            anchors,
            ratio: job.ratio,
            path,
            width: f64::from(job.width),
            height: f64::from(job.height),
            rng: StdRng::from_seed(*seed.as_bytes()),
        })
    }

    fn toward(&self, from: (f64, f64), anchor: usize) -> (f64, f64) {
        let (ax, ay) = self.anchors[anchor];
        (
            from.0 + self.ratio * (ax - from.0),
            from.1 + self.ratio * (ay - from.1),
        )
    }

    /// Advance the game and return the next point on the canvas.
    pub fn next_point(&mut self) -> Point {
        let anchor = self.rng.gen_range(0..self.anchors.len());
        self.current = self.toward(self.current, anchor);

        // Innermost contraction is the last digit.
        let (x, y) = self
            .path
            .iter()
            .rev()
            .fold(self.current, |p, &digit| self.toward(p, digit));

        Point::new(
            x.round().clamp(0.0, self.width) as i64,
            y.round().clamp(0.0, self.height) as i64,
        )
    }
}

/// Generate points into `points` until `target` exist or `stop` fires.
pub fn spawn_compute(
    mut game: ChaosGame,
    target: u64,
    points: Arc<Mutex<Vec<Point>>>,
    settings: ComputeConfig,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval.max(MIN_TICK));
        let per_tick = settings.batch.max(1) as u64;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            let mut points = points.lock().await;
            let have = points.len() as u64;
            if have >= target {
                break;
            }
            let batch = per_tick.min(target - have);
            for _ in 0..batch {
                points.push(game.next_point());
            }
        }
    })
}
