//! Real-valued multi-channel feature maps with an explicit axis layout.

use crate::array_utils::wrap_index;
use crate::config::DataLayout;
use crate::error::{shape, Result};
use cfl::ndarray::{concatenate, Array4, ArrayView4, Axis, CowArray, Ix4};

/// A (batch, channels, z, y) feature tensor stored in the axis order given by its layout. The layout
/// travels with the data and is never inferred from the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    data: Array4<f32>,
    layout: DataLayout,
}

impl DataLayout {
    pub fn channel_axis(&self) -> Axis {
        match self {
            DataLayout::ChannelsFirst => Axis(1),
            DataLayout::ChannelsLast => Axis(3),
        }
    }

    pub fn z_axis(&self) -> Axis {
        match self {
            DataLayout::ChannelsFirst => Axis(2),
            DataLayout::ChannelsLast => Axis(1),
        }
    }

    pub fn y_axis(&self) -> Axis {
        match self {
            DataLayout::ChannelsFirst => Axis(3),
            DataLayout::ChannelsLast => Axis(2),
        }
    }

    /// storage dims for a tensor with the given semantic extent
    pub fn shape(&self, batch: usize, channels: usize, nz: usize, ny: usize) -> (usize, usize, usize, usize) {
        match self {
            DataLayout::ChannelsFirst => (batch, channels, nz, ny),
            DataLayout::ChannelsLast => (batch, nz, ny, channels),
        }
    }
}

impl FeatureMap {
    pub fn new(data: Array4<f32>, layout: DataLayout) -> Self {
        Self { data, layout }
    }

    pub fn zeros(batch: usize, channels: usize, nz: usize, ny: usize, layout: DataLayout) -> Self {
        Self::new(Array4::zeros(layout.shape(batch, channels, nz, ny)), layout)
    }

    /// builds a feature map from a channels-first array, storing it in the requested layout
    pub fn from_channels_first(data: Array4<f32>, layout: DataLayout) -> Self {
        Self::new(data, DataLayout::ChannelsFirst).into_layout(layout)
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    pub fn batch(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(self.layout.channel_axis())
    }

    /// spatial extent (z, y)
    pub fn spatial(&self) -> (usize, usize) {
        (self.data.len_of(self.layout.z_axis()), self.data.len_of(self.layout.y_axis()))
    }

    /// channels-first view of the data, regardless of the storage layout
    pub fn channels_first(&self) -> ArrayView4<'_, f32> {
        match self.layout {
            DataLayout::ChannelsFirst => self.data.view(),
            DataLayout::ChannelsLast => self.data.view().permuted_axes([0, 3, 1, 2]),
        }
    }

    /// contiguous channels-first data, borrowing when the storage already is
    pub fn channels_first_standard(&self) -> CowArray<'_, f32, Ix4> {
        let view = self.channels_first();
        if view.is_standard_layout() {
            CowArray::from(view)
        } else {
            CowArray::from(view.as_standard_layout().into_owned())
        }
    }

    pub fn into_layout(self, layout: DataLayout) -> Self {
        if self.layout == layout {
            return self;
        }
        let permuted = match layout {
            DataLayout::ChannelsLast => self.data.permuted_axes([0, 2, 3, 1]),
            DataLayout::ChannelsFirst => self.data.permuted_axes([0, 3, 1, 2]),
        };
        Self::new(permuted.as_standard_layout().into_owned(), layout)
    }

    /// extends both spatial axes by `pad` samples on each side with a periodic boundary
    pub fn circular_pad(&self, pad: usize) -> Self {
        if pad == 0 {
            return self.clone();
        }
        let (nz, ny) = self.spatial();
        let (za, ya) = (self.layout.z_axis().index(), self.layout.y_axis().index());
        let mut dims = [0usize; 4];
        dims.copy_from_slice(self.data.shape());
        dims[za] += 2 * pad;
        dims[ya] += 2 * pad;
        let padded = Array4::from_shape_fn(dims, |(a, b, c, d)| {
            let mut idx = [a, b, c, d];
            idx[za] = wrap_index(idx[za] as isize - pad as isize, nz);
            idx[ya] = wrap_index(idx[ya] as isize - pad as isize, ny);
            self.data[idx]
        });
        Self::new(padded, self.layout)
    }

    /// removes `pad` samples from each side of both spatial axes
    pub fn crop(&self, pad: usize) -> Result<Self> {
        if pad == 0 {
            return Ok(self.clone());
        }
        let (nz, ny) = self.spatial();
        if nz < 2 * pad || ny < 2 * pad {
            return Err(shape(format!("can't crop {} from each side of a {}x{} feature map", pad, nz, ny)));
        }
        let mut view = self.data.view();
        view.slice_axis_inplace(self.layout.z_axis(), (pad..nz - pad).into());
        view.slice_axis_inplace(self.layout.y_axis(), (pad..ny - pad).into());
        Ok(Self::new(view.as_standard_layout().into_owned(), self.layout))
    }

    /// concatenates feature maps along the channel axis
    pub fn concat_channels(maps: &[&FeatureMap]) -> Result<Self> {
        let first = maps.first().ok_or_else(|| shape("nothing to concatenate"))?;
        let layout = first.layout;
        let (batch, spatial) = (first.batch(), first.spatial());
        for m in maps {
            if m.layout != layout || m.batch() != batch || m.spatial() != spatial {
                return Err(shape(format!(
                    "can't concatenate {:?} {:?} with {:?} {:?}",
                    m.layout, m.data.dim(), layout, first.data.dim()
                )));
            }
        }
        let views = maps.iter().map(|m| m.data.view()).collect::<Vec<_>>();
        let data = concatenate(layout.channel_axis(), &views).map_err(|e| shape(e.to_string()))?;
        Ok(Self::new(data, layout))
    }

    /// elementwise sum of two feature maps of identical shape and layout
    pub fn add(&self, other: &FeatureMap) -> Result<Self> {
        if self.layout != other.layout || self.data.dim() != other.data.dim() {
            return Err(shape(format!(
                "can't add {:?} {:?} to {:?} {:?}",
                other.layout, other.data.dim(), self.layout, self.data.dim()
            )));
        }
        Ok(Self::new(&self.data + &other.data, self.layout))
    }
}
