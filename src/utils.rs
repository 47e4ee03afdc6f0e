use std::future::Future;

const UINT16SIZE_HALF: u16 = 1 << 15;
const UINT32SIZE_HALF: u32 = 1 << 31;

/// SeqUnwrapper turns 16-bit RTP sequence numbers into a monotonic 64-bit
/// extended counter across rollovers. The first value is given one full
/// cycle of headroom so that reordered packets older than the first one
/// still map to a valid extended value.
#[derive(Default, Debug)]
pub struct SeqUnwrapper {
    started: bool,
    highest: u16,
    ext_highest: u64,
}

impl SeqUnwrapper {
    /// Returns the extended counterpart of `seq`. The internal highest value
    /// only advances for forward jumps (less than half the number space).
    pub fn unwrap(&mut self, seq: u16) -> u64 {
        if !self.started {
            self.started = true;
            self.highest = seq;
            self.ext_highest = (1u64 << 16) + seq as u64;
            return self.ext_highest;
        }

        let diff = seq.wrapping_sub(self.highest);
        if diff == 0 {
            return self.ext_highest;
        }
        if diff < UINT16SIZE_HALF {
            self.ext_highest += diff as u64;
            self.highest = seq;
            self.ext_highest
        } else {
            self.ext_highest - self.highest.wrapping_sub(seq) as u64
        }
    }

    pub fn ext_highest(&self) -> u64 {
        self.ext_highest
    }
}

/// TsUnwrapper is the 32-bit timestamp counterpart of [`SeqUnwrapper`].
#[derive(Default, Debug)]
pub struct TsUnwrapper {
    started: bool,
    highest: u32,
    ext_highest: u64,
}

impl TsUnwrapper {
    pub fn unwrap(&mut self, ts: u32) -> u64 {
        if !self.started {
            self.started = true;
            self.highest = ts;
            self.ext_highest = (1u64 << 32) + ts as u64;
            return self.ext_highest;
        }

        let diff = ts.wrapping_sub(self.highest);
        if diff == 0 {
            return self.ext_highest;
        }
        if diff < UINT32SIZE_HALF {
            self.ext_highest += diff as u64;
            self.highest = ts;
            self.ext_highest
        } else {
            self.ext_highest - self.highest.wrapping_sub(ts) as u64
        }
    }

    pub fn ext_highest(&self) -> u64 {
        self.ext_highest
    }
}

/// Median of a float sample set, 0.0 when empty.
pub fn median_f32(input: &mut [f32]) -> f32 {
    let num = input.len();
    if num == 0 {
        return 0.0;
    } else if num == 1 {
        return input[0];
    }
    input.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if num % 2 != 0 {
        return input[num / 2];
    }
    (input[num / 2 - 1] + input[num / 2]) / 2.0
}

/// Spawns a long-lived task whose panic is logged and contained instead of
/// propagating to neighbouring sessions.
pub(crate) fn spawn_isolated<F>(name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            if err.is_panic() {
                log::error!("task {name} panicked: {err:?}");
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seq_unwrap_forward_and_rollover() {
        let mut u = SeqUnwrapper::default();
        let base = u.unwrap(65533);
        assert_eq!(u.unwrap(65534), base + 1);
        assert_eq!(u.unwrap(65535), base + 2);
        assert_eq!(u.unwrap(0), base + 3);
        assert_eq!(u.unwrap(1), base + 4);
    }

    #[test]
    fn test_seq_unwrap_reordered() {
        let mut u = SeqUnwrapper::default();
        let base = u.unwrap(1000);
        assert_eq!(u.unwrap(1004), base + 4);
        // late arrival does not move the highest value
        assert_eq!(u.unwrap(1002), base + 2);
        assert_eq!(u.unwrap(1005), base + 5);
    }

    #[test]
    fn test_seq_unwrap_reordered_before_first() {
        let mut u = SeqUnwrapper::default();
        let base = u.unwrap(2);
        assert_eq!(u.unwrap(65535), base - 3);
    }

    #[test]
    fn test_ts_unwrap_rollover() {
        let mut u = TsUnwrapper::default();
        let base = u.unwrap(u32::MAX - 2999);
        assert_eq!(u.unwrap(1), base + 3001);
    }

    #[test]
    fn test_median() {
        assert_eq!(median_f32(&mut []), 0.0);
        assert_eq!(median_f32(&mut [3.0]), 3.0);
        assert_eq!(median_f32(&mut [5.0, 1.0, 3.0]), 3.0);
        assert_eq!(median_f32(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
