//! Generates moving NV12 test patterns to feed encoders with.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("invalid stride")]
    InvalidStride,
    #[error("odd dimensions are not supported by 4:2:0 layouts")]
    OddDimensions,
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("provided buffer is too small")]
    BufferTooSmall,
}

pub struct FrameGenerator {
    width: usize,
    height: usize,
    stride: usize,
    step: u32,
}

impl FrameGenerator {
    pub fn new(width: usize, height: usize, stride: usize) -> Result<Self, NewFrameGeneratorError> {
        if stride < width {
            return Err(NewFrameGeneratorError::InvalidStride);
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(NewFrameGeneratorError::OddDimensions);
        }

        Ok(FrameGenerator {
            width,
            height,
            stride,
            step: 0,
        })
    }

    /// Size of the luma plane followed by the interleaved chroma plane.
    pub fn frame_size(&self) -> usize {
        self.stride * self.height * 3 / 2
    }

    /// Number of frames generated so far.
    pub fn frames_generated(&self) -> u32 {
        self.step
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn gen_pattern(&mut self, frame: &mut [u8]) {
        let (luma, chroma) = frame.split_at_mut(self.stride * self.height);

        luma.chunks_exact_mut(self.stride)
            .map(|l| &mut l[0..self.width])
            .enumerate()
            .for_each(|(y, line)| {
                line.iter_mut().enumerate().for_each(|(x, pixel)| {
                    *pixel = self.step.wrapping_add((x ^ y) as u32) as u8;
                });
            });

        chroma
            .chunks_exact_mut(self.stride)
            .take(self.height / 2)
            .map(|l| &mut l[0..self.width])
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(2).enumerate().for_each(|(x, uv)| {
                    uv[0] = 128u8.wrapping_add((x + self.step as usize) as u8);
                    uv[1] = 128u8.wrapping_sub((y + self.step as usize) as u8);
                });
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        let mut gen = FrameGenerator::new(16, 16, 16).unwrap();
        let mut frame = vec![0u8; 16 * 16];

        assert!(matches!(
            gen.next_frame(&mut frame),
            Err(GenerateFrameError::BufferTooSmall)
        ));
        assert_eq!(gen.frames_generated(), 0);
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut gen = FrameGenerator::new(16, 8, 32).unwrap();
        let mut first = vec![0u8; gen.frame_size()];
        let mut second = vec![0u8; gen.frame_size()];

        gen.next_frame(&mut first).unwrap();
        gen.next_frame(&mut second).unwrap();

        assert_ne!(first, second);
        // Padding bytes past the visible width are left untouched.
        assert_eq!(first[20], 0);
    }
}
