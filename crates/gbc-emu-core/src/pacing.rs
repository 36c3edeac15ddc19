//! Real-time frame pacing.

use std::time::{Duration, Instant};

use crossbeam_channel as cb;

pub const GB_FPS: f64 = 59.7275;
pub const FRAME_TIME: Duration = Duration::from_nanos((1e9_f64 / GB_FPS) as u64);

/// Sleeps between frames so emulation runs at the display refresh rate,
/// scaled by a speed multiplier. A [`StopHandle`] wakes it early.
#[derive(Debug)]
pub struct Pacer {
    next_frame: Option<Instant>,
    pub speed: f64,
    /// Skip sleeping entirely (muted fast-forward, or audio sets the pace).
    pub bypass: bool,
    stop_rx: cb::Receiver<()>,
    stopped: bool,
}

/// Host-side handle that interrupts a sleeping [`Pacer`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: cb::Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

impl Pacer {
    pub fn new(speed: f64) -> (Self, StopHandle) {
        let (tx, rx) = cb::bounded(1);
        (
            Self {
                next_frame: None,
                speed,
                bypass: false,
                stop_rx: rx,
                stopped: false,
            },
            StopHandle { tx },
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn frame_time(&self) -> Duration {
        if self.speed > 0.0 {
            FRAME_TIME.div_f64(self.speed)
        } else {
            FRAME_TIME
        }
    }

    /// Wait until the next frame is due. Returns false once a stop has been
    /// requested, without finishing the wait.
    pub fn wait_frame(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        let frame_time = self.frame_time();
        if self.bypass {
            self.next_frame = None;
            return !self.poll_stop();
        }

        let now = Instant::now();
        let target = *self.next_frame.get_or_insert(now + frame_time);
        if target > now {
            match self.stop_rx.recv_timeout(target - now) {
                Ok(()) | Err(cb::RecvTimeoutError::Disconnected) => {
                    self.stopped = true;
                    return false;
                }
                Err(cb::RecvTimeoutError::Timeout) => {}
            }
            self.next_frame = Some(target + frame_time);
        } else {
            // Too far behind to catch up; restart the cadence from now.
            self.next_frame = Some(now + frame_time);
        }
        true
    }

    fn poll_stop(&mut self) -> bool {
        match self.stop_rx.try_recv() {
            Ok(()) | Err(cb::TryRecvError::Disconnected) => self.stopped = true,
            Err(cb::TryRecvError::Empty) => {}
        }
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stop_interrupts_a_long_sleep() {
        let (mut pacer, stop) = Pacer::new(0.001);
        let start = Instant::now();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.stop();
        });
        assert!(!pacer.wait_frame());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(pacer.is_stopped());
        t.join().unwrap();
    }

    #[test]
    fn bypass_never_sleeps() {
        let (mut pacer, _stop) = Pacer::new(1.0);
        pacer.bypass = true;
        let start = Instant::now();
        for _ in 0..100 {
            assert!(pacer.wait_frame());
        }
        assert!(start.elapsed() < FRAME_TIME * 50);
    }
}
