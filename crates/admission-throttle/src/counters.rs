use tokio::time::{Duration, Instant};

/// A rolling send counter held in a fixed ring of equal-duration
/// buckets. Increments always land in the bucket covering the current
/// instant; as time advances, stale buckets are zeroed lazily on the
/// next access, so no background task is needed to age data out.
pub struct CounterRing {
    buckets: Vec<u64>,
    bucket_seconds: u64,
    current: usize,
    rotated_at: Instant,
}

impl CounterRing {
    pub fn new(num_buckets: usize, bucket_seconds: u64) -> Self {
        Self {
            buckets: vec![0; num_buckets],
            bucket_seconds,
            current: 0,
            rotated_at: Instant::now(),
        }
    }

    /// A ring sized so that `total()` reports the trailing `window`,
    /// divided into `num_buckets` slots.
    pub fn for_window(window: Duration, num_buckets: usize) -> Self {
        let bucket_seconds = (window.as_secs() / num_buckets as u64).max(1);
        Self::new(num_buckets, bucket_seconds)
    }

    /// Advance the current slot to cover now, zeroing every slot that
    /// was skipped over. The zeroing count is clipped to the ring size
    /// so a long-idle ring costs one full sweep at most.
    fn rotate(&mut self) -> usize {
        let len = self.buckets.len();
        let elapsed_slots = (self.rotated_at.elapsed().as_secs() / self.bucket_seconds) as usize;

        if elapsed_slots > 0 {
            self.current = (self.current + elapsed_slots) % len;
            // Advance by whole slots so the sub-bucket remainder
            // carries over; re-anchoring to now would let boundaries
            // drift with access timing.
            self.rotated_at += Duration::from_secs(elapsed_slots as u64 * self.bucket_seconds);
            for back in 0..elapsed_slots.min(len) {
                let idx = (self.current + len - back) % len;
                self.buckets[idx] = 0;
            }
        }
        self.current
    }

    pub fn increment(&mut self, count: u64) {
        let idx = self.rotate();
        self.buckets[idx] = self.buckets[idx].saturating_add(count);
    }

    /// Total across the whole ring span.
    pub fn total(&mut self) -> u64 {
        self.rotate();
        self.buckets.iter().sum()
    }

    /// Total over the trailing `duration`, rounded up to whole
    /// buckets.
    pub fn total_over(&mut self, duration: Duration) -> u64 {
        let idx = self.rotate();
        let len = self.buckets.len();
        let span = (duration.as_secs().div_ceil(self.bucket_seconds) as usize)
            .clamp(1, len);

        (0..span)
            .map(|back| self.buckets[(idx + len - back) % len])
            .sum()
    }

    pub fn reset(&mut self) {
        self.buckets.fill(0);
        self.current = 0;
        self.rotated_at = Instant::now();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn counts_within_a_bucket() {
        let mut ring = CounterRing::new(4, 10);
        ring.increment(3);
        ring.increment(2);
        k9::assert_equal!(ring.total(), 5);
    }

    #[tokio::test]
    async fn old_buckets_age_out() {
        tokio::time::pause();
        let mut ring = CounterRing::new(3, 10);

        ring.increment(5);
        tokio::time::advance(Duration::from_secs(10)).await;
        ring.increment(7);
        k9::assert_equal!(ring.total(), 12);
        k9::assert_equal!(ring.total_over(Duration::from_secs(10)), 7);

        // The first bucket falls off the back of the ring, but the 7
        // is still inside the trailing 30s span
        tokio::time::advance(Duration::from_secs(20)).await;
        k9::assert_equal!(ring.total(), 7);

        tokio::time::advance(Duration::from_secs(10)).await;
        k9::assert_equal!(ring.total(), 0);
    }

    #[tokio::test]
    async fn bucket_boundaries_do_not_drift_with_access_timing() {
        tokio::time::pause();
        let mut ring = CounterRing::new(2, 10);
        ring.increment(4);

        // Reading mid-bucket must not re-anchor the boundary
        tokio::time::advance(Duration::from_secs(15)).await;
        k9::assert_equal!(ring.total(), 4);

        // 20s after the increment the span has fully moved past it
        tokio::time::advance(Duration::from_secs(5)).await;
        k9::assert_equal!(ring.total(), 0);
    }

    #[tokio::test]
    async fn long_idle_ring_zeroes_cleanly() {
        tokio::time::pause();
        let mut ring = CounterRing::new(3, 10);
        ring.increment(9);

        tokio::time::advance(Duration::from_secs(1000)).await;
        k9::assert_equal!(ring.total(), 0);
        ring.increment(1);
        k9::assert_equal!(ring.total(), 1);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let mut ring = CounterRing::new(4, 10);
        ring.increment(100);
        ring.reset();
        k9::assert_equal!(ring.total(), 0);
    }
}
