use crate::transform::Transform;
use crate::Result;

/// A dense row-major channel of integer samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub w: usize,
    pub h: usize,
    pub hshift: i32,
    pub vshift: i32,
    pub(crate) data: Vec<i32>,
}

impl Channel {
    pub fn new(w: usize, h: usize) -> Self {
        Self::with_shift(w, h, 0, 0)
    }

    pub fn with_shift(w: usize, h: usize, hshift: i32, vshift: i32) -> Self {
        Self {
            w,
            h,
            hshift,
            vshift,
            data: vec![0; w * h],
        }
    }

    pub fn from_data(w: usize, h: usize, data: Vec<i32>) -> Self {
        assert_eq!(data.len(), w * h);
        Self {
            w,
            h,
            hshift: 0,
            vshift: 0,
            data,
        }
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[i32] {
        &self.data[y * self.w..(y + 1) * self.w]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [i32] {
        &mut self.data[y * self.w..(y + 1) * self.w]
    }

    #[inline]
    pub fn data(&self) -> &[i32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [i32] {
        &mut self.data
    }
}

/// An ordered set of channels: `nb_meta_channels` meta channels followed by
/// data channels, plus the transforms that were applied to them.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub w: usize,
    pub h: usize,
    pub nb_meta_channels: usize,
    pub channel: Vec<Channel>,
    pub transform: Vec<Transform>,
    /// Set by the transform layer when it detects corruption.
    pub error: bool,
}

impl Image {
    pub fn new(w: usize, h: usize) -> Self {
        Self {
            w,
            h,
            ..Self::default()
        }
    }

    /// Inverts the last `n` recorded transforms; `-1` inverts all of them.
    pub fn undo_transforms(&mut self, n: i32) -> Result<()> {
        let count = if n < 0 {
            self.transform.len()
        } else {
            (n as usize).min(self.transform.len())
        };
        for _ in 0..count {
            let transform = self.transform.pop().unwrap();
            transform.inverse(self)?;
        }
        Ok(())
    }
}
