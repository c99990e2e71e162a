use std::time::Instant;

/// Wall-clock stopwatch used to compute the frame delta time.
pub struct Timer {
    last: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Returns the seconds elapsed since the previous tick (or since start).
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let delta = now.duration_since(self.last);
        self.last = now;
        delta.as_secs_f32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let mut timer = Timer::start();
        let first = timer.tick();
        let second = timer.tick();
        assert!(first >= 0.0);
        assert!(second >= 0.0);
    }
}
