//! Feedback delay: stereo echo line used as an effect send.

/// A stereo delay line with internal feedback. Output is wet only; the dry
/// signal is carried by whatever bus feeds the send.
#[derive(Debug, Clone)]
pub struct FeedbackDelay {
    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,

    /// Delay time in seconds.
    pub delay_time: f64,
    /// Feedback amount, kept below 1.0 so echoes always die out.
    pub feedback: f64,
}

impl FeedbackDelay {
    /// Create a delay holding up to `max_delay_seconds` of audio.
    pub fn new(sample_rate: f64, max_delay_seconds: f64, delay_time: f64, feedback: f64) -> Self {
        let buffer_size = (sample_rate * max_delay_seconds) as usize + 1;
        Self {
            buffer_l: vec![0.0; buffer_size],
            buffer_r: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            delay_time: delay_time.clamp(0.0, max_delay_seconds),
            feedback: feedback.clamp(0.0, 0.95),
        }
    }

    /// Process one stereo frame, returning the delayed (wet) signal.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let buffer_len = self.buffer_l.len();
        let delay_samples = ((self.delay_time * self.sample_rate) as usize).clamp(1, buffer_len - 1);
        let read_pos = (self.write_pos + buffer_len - delay_samples) % buffer_len;

        let delayed_l = self.buffer_l[read_pos];
        let delayed_r = self.buffer_r[read_pos];

        let fb = self.feedback as f32;
        self.buffer_l[self.write_pos] = left + delayed_l * fb;
        self.buffer_r[self.write_pos] = right + delayed_r * fb;
        self.write_pos = (self.write_pos + 1) % buffer_len;

        (delayed_l, delayed_r)
    }

    /// Process a block of stereo audio in-place.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (out_l, out_r) = self.process(*l, *r);
            *l = out_l;
            *r = out_r;
        }
    }
}
