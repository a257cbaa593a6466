//! Rate limiting of raw per-segment write progress.

/// A progress update for one segment, as delivered to an [`EventSink`](crate::sink::EventSink).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub segment_index: usize,
    pub bytes_written: u64,
    pub bytes_total: u64,
    pub percent: u8,
}

#[derive(Debug)]
struct SegmentProgress {
    index: usize,
    total: u64,
    last_percent: u8,
    completed: bool,
}

/// Turns raw `(segment, written, total)` callbacks into throttled [`ProgressEvent`]s.
///
/// Within a segment the emitted percentage never decreases. Every segment
/// gets exactly one event at 0% and one at 100%; in between an event is
/// emitted only once the percentage has grown by at least `step` points
/// since the last emitted one. Moving to another segment closes the
/// previous one with a 100% event if the writer never reported it.
#[derive(Debug)]
pub struct ProgressAccumulator {
    step: u8,
    current: Option<SegmentProgress>,
}

impl Default for ProgressAccumulator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ProgressAccumulator {
    /// Creates an accumulator emitting at most one event per `step` percent.
    /// `step` is clamped to `1..=100`.
    pub fn new(step: u8) -> Self {
        Self {
            step: step.clamp(1, 100),
            current: None,
        }
    }

    /// Forgets all per-segment state.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Feeds one raw callback and returns the events it produces, in order.
    pub fn observe(
        &mut self,
        segment_index: usize,
        bytes_written: u64,
        bytes_total: u64,
    ) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        let percent = percent_of(bytes_written, bytes_total);

        let same_segment = self
            .current
            .as_ref()
            .is_some_and(|segment| segment.index == segment_index);

        if !same_segment {
            if let Some(previous) = self.close_current() {
                events.push(previous);
            }
            self.current = Some(SegmentProgress {
                index: segment_index,
                total: bytes_total,
                last_percent: 0,
                completed: false,
            });
            events.push(ProgressEvent {
                segment_index,
                bytes_written: 0,
                bytes_total,
                percent: 0,
            });
        }

        let step = self.step;
        let Some(segment) = self.current.as_mut() else {
            return events;
        };
        segment.total = bytes_total;

        if segment.completed || percent <= segment.last_percent {
            return events;
        }

        if percent == 100 || percent - segment.last_percent >= step {
            segment.last_percent = percent;
            segment.completed = percent == 100;
            events.push(ProgressEvent {
                segment_index,
                bytes_written: bytes_written.min(bytes_total),
                bytes_total,
                percent,
            });
        }

        events
    }

    /// Closes the segment in progress, returning its 100% event if it was
    /// never reported. Call once the writer has returned successfully.
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        self.close_current()
    }

    fn close_current(&mut self) -> Option<ProgressEvent> {
        let segment = self.current.take()?;
        if segment.completed {
            return None;
        }
        Some(ProgressEvent {
            segment_index: segment.index,
            bytes_written: segment.total,
            bytes_total: segment.total,
            percent: 100,
        })
    }
}

fn percent_of(written: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = u128::from(written.min(total)) * 100 / u128::from(total);
    u8::try_from(percent).unwrap_or(100)
}
