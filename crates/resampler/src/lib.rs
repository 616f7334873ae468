// Audio resampling and channel conversion

/// Streaming sample-rate and channel converter.
///
/// Linear interpolation driven by an exact integer phase accumulator: the
/// read position advances by `input_rate / output_rate` input frames per
/// output frame, tracked as a whole index plus a remainder in units of
/// `1 / output_rate`. Chunk boundaries therefore never change the output.
pub struct Converter {
    input_rate: u32,
    output_rate: u32,
    input_channels: u16,
    output_channels: u16,
    /// Whole input frames ahead of the oldest retained frame
    index: u64,
    /// Fractional position, in units of 1 / output_rate
    phase: u64,
    /// Last frame of the previous chunk, in the output channel layout
    carry: Vec<f32>,
}

impl Converter {
    pub fn new(input_rate: u32, output_rate: u32, input_channels: u16, output_channels: u16) -> Self {
        Self {
            input_rate: input_rate.max(1),
            output_rate: output_rate.max(1),
            input_channels: input_channels.max(1),
            output_channels: output_channels.max(1),
            index: 0,
            phase: 0,
            carry: Vec::new(),
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn input_channels(&self) -> u16 {
        self.input_channels
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }

    pub fn is_passthrough(&self) -> bool {
        !needs_resampling(
            self.input_rate,
            self.output_rate,
            self.input_channels,
            self.output_channels,
        )
    }

    /// Forget interpolation state, e.g. after a seek
    pub fn reset(&mut self) {
        self.index = 0;
        self.phase = 0;
        self.carry.clear();
    }

    /// Convert one chunk of interleaved input, appending to `output`
    pub fn process_into(&mut self, input: &[f32], output: &mut Vec<f32>) {
        if self.is_passthrough() {
            output.extend_from_slice(input);
            return;
        }

        let frames = self.convert_channels(input);
        if self.input_rate == self.output_rate {
            output.extend_from_slice(&frames);
            return;
        }
        self.resample(frames, output);
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(self.estimate_output_len(input.len()));
        self.process_into(input, &mut output);
        output
    }

    fn estimate_output_len(&self, input_samples: usize) -> usize {
        let frames = input_samples / self.input_channels as usize;
        let out = frames as u64 * self.output_rate as u64 / self.input_rate as u64 + 2;
        out as usize * self.output_channels as usize
    }

    /// Map each input frame onto the output channel layout
    fn convert_channels(&self, input: &[f32]) -> Vec<f32> {
        let in_ch = self.input_channels as usize;
        let out_ch = self.output_channels as usize;
        if in_ch == out_ch {
            return input.to_vec();
        }

        let mut output = Vec::with_capacity(input.len() / in_ch * out_ch);
        for frame in input.chunks_exact(in_ch) {
            match (in_ch, out_ch) {
                // Mono to anything: duplicate
                (1, _) => output.extend(std::iter::repeat(frame[0]).take(out_ch)),
                // Anything to mono: average
                (_, 1) => output.push(frame.iter().sum::<f32>() / in_ch as f32),
                _ => output.extend((0..out_ch).map(|c| frame[c % in_ch])),
            }
        }
        output
    }

    fn resample(&mut self, frames: Vec<f32>, output: &mut Vec<f32>) {
        let ch = self.output_channels as usize;
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(&frames);
        let available = (buf.len() / ch) as u64;
        if available == 0 {
            return;
        }

        let out_rate = self.output_rate as u64;
        while self.index + 1 < available {
            let i = self.index as usize * ch;
            let frac = self.phase as f32 / out_rate as f32;
            for c in 0..ch {
                let a = buf[i + c];
                let b = buf[i + ch + c];
                output.push(a + (b - a) * frac);
            }

            self.phase += self.input_rate as u64;
            self.index += self.phase / out_rate;
            self.phase %= out_rate;
        }

        // Keep the last frame; index becomes relative to it
        self.index -= available - 1;
        let last = (available as usize - 1) * ch;
        self.carry = buf[last..last + ch].to_vec();
    }
}

/// Check if resampling is needed
pub fn needs_resampling(input_rate: u32, output_rate: u32, input_channels: u16, output_channels: u16) -> bool {
    input_rate != output_rate || input_channels != output_channels
}
