use log::debug;

use super::*;

/// Look-ahead windows the hardware supports, besides 0 (disabled).
pub const LOOKAHEAD_RANGE: std::ops::RangeInclusive<u32> = 2..=40;

/// Configuration of an encoder module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncSettings {
    pub codec: Codec,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride_alignment: Stride,
    pub clock: Clock,
    pub bitrate: Bitrate,
    pub gop: Gop,
    buffer_counts: BufferCounts,
    pub handles: BufferHandleTypes,
    pub lookahead: u32,
    pub two_pass: bool,
    pub sei: SeiFlags,
    pub crop: Rect,
    pub separate_configuration: bool,
    pub subframe_latency: bool,
    /// Number of slices per frame in subframe latency mode.
    pub slices: u32,
    pub loop_filter: LoopFilter,
}

impl Default for EncSettings {
    fn default() -> Self {
        let resolution = Resolution::new(1920, 1080);
        EncSettings {
            codec: Codec::default(),
            resolution,
            format: PixelFormat::NV12,
            stride_alignment: Stride {
                horizontal: 32,
                vertical: 32,
            },
            clock: Clock::default(),
            bitrate: Bitrate::default(),
            gop: Gop::default(),
            buffer_counts: BufferCounts {
                input: 2,
                output: 2,
            },
            handles: BufferHandleTypes::default(),
            lookahead: 0,
            two_pass: false,
            sei: SeiFlags::empty(),
            crop: Rect::new(0, 0, resolution.width, resolution.height),
            separate_configuration: false,
            subframe_latency: false,
            slices: 4,
            loop_filter: LoopFilter::default(),
        }
    }
}

impl EncSettings {
    /// Number of hardware channels used to encode a frame.
    pub fn passes(&self) -> usize {
        if self.lookahead > 0 || self.two_pass {
            2
        } else {
            1
        }
    }

    /// Number of analyzed frames kept before the final pass encodes the
    /// oldest of them.
    pub fn lookahead_window(&self) -> usize {
        self.lookahead.max(1) as usize
    }

    /// Layout of source pictures.
    pub fn stride(&self) -> Stride {
        Stride::for_picture(self.resolution, self.format, self.stride_alignment).unwrap_or_default()
    }

    pub fn buffer_sizes(&self) -> BufferSizes {
        let input = self.stride().picture_size(self.format).unwrap_or(0);
        // Worst case for a compressed frame, with room for parameter sets.
        let output = (self.resolution.width as usize * self.resolution.height as usize * 3 / 4)
            .max(64 * 1024);
        BufferSizes { input, output }
    }

    /// Smallest number of buffers the module can run with.
    pub fn min_buffer_counts(&self) -> BufferCounts {
        let extra_input = if self.passes() > 1 {
            self.lookahead_window() as u32
        } else {
            0
        };
        let extra_output = if self.separate_configuration { 1 } else { 0 };
        BufferCounts {
            input: 2 + extra_input,
            output: 2 + extra_output,
        }
    }

    pub fn buffer_counts(&self) -> BufferCounts {
        let min = self.min_buffer_counts();
        BufferCounts {
            input: self.buffer_counts.input.max(min.input),
            output: self.buffer_counts.output.max(min.output),
        }
    }
}

impl MediaSettings for EncSettings {
    fn get(&self, property: Property) -> SettingsResult<PropertyValue> {
        Ok(match property {
            Property::Codec => PropertyValue::Codec(self.codec),
            Property::Resolution => PropertyValue::Resolution(self.resolution),
            Property::Format => PropertyValue::Format(self.format),
            Property::StrideAlignment => PropertyValue::StrideAlignment(self.stride_alignment),
            Property::Clock => PropertyValue::Clock(self.clock),
            Property::Bitrate => PropertyValue::Bitrate(self.bitrate),
            Property::Gop => PropertyValue::Gop(self.gop),
            Property::BufferCounts => PropertyValue::BufferCounts(self.buffer_counts()),
            Property::BufferSizes => PropertyValue::BufferSizes(self.buffer_sizes()),
            Property::BufferHandles => PropertyValue::BufferHandles(self.handles),
            Property::LookAhead => PropertyValue::LookAhead(self.lookahead),
            Property::TwoPass => PropertyValue::TwoPass(self.two_pass),
            Property::Sei => PropertyValue::Sei(self.sei),
            Property::RateControlPlugin => PropertyValue::RateControlPlugin(false),
            Property::Crop => PropertyValue::Crop(self.crop),
            Property::SeparateConfiguration => {
                PropertyValue::SeparateConfiguration(self.separate_configuration)
            }
            Property::SubframeLatency => PropertyValue::SubframeLatency(self.subframe_latency),
            Property::LoopFilter => PropertyValue::LoopFilter(self.loop_filter),
            Property::CopyOnDisplay => return Err(SettingsError::BadIndex(property)),
        })
    }

    fn set(&mut self, value: PropertyValue) -> SettingsResult<()> {
        let property = value.property();
        debug!("Encoder settings: {:?}", value);
        match value {
            PropertyValue::Codec(codec) => self.codec = codec,
            PropertyValue::Resolution(resolution) => {
                check_resolution(resolution, self.format)?;
                self.resolution = resolution;
                self.crop = Rect::new(0, 0, resolution.width, resolution.height);
            }
            PropertyValue::Format(format) => {
                check_format(format)?;
                check_resolution(self.resolution, format)?;
                self.format = format;
            }
            PropertyValue::StrideAlignment(alignment) => {
                check_alignment(alignment)?;
                self.stride_alignment = alignment;
            }
            PropertyValue::Clock(clock) => {
                check_clock(clock)?;
                self.clock = clock;
            }
            PropertyValue::Bitrate(bitrate) => {
                if bitrate.target == 0 && bitrate.mode != RateControlMode::ConstantQp {
                    return bad_parameter(property, "target bitrate must be non-zero");
                }
                if bitrate.max < bitrate.target {
                    return bad_parameter(property, "maximum bitrate is below the target");
                }
                self.bitrate = bitrate;
            }
            PropertyValue::Gop(gop) => {
                if gop.length == 0 || gop.b_frames >= gop.length {
                    return bad_parameter(property, format!("invalid GOP structure {:?}", gop));
                }
                self.gop = gop;
            }
            PropertyValue::BufferCounts(counts) => {
                let min = self.min_buffer_counts();
                if counts.input < min.input || counts.output < min.output {
                    return bad_parameter(
                        property,
                        format!("at least {:?} buffers are needed", min),
                    );
                }
                self.buffer_counts = counts;
            }
            PropertyValue::BufferSizes(_) => {
                return bad_parameter(property, "buffer sizes are derived from the resolution")
            }
            PropertyValue::BufferHandles(handles) => self.handles = handles,
            PropertyValue::LookAhead(lookahead) => {
                if lookahead != 0 && !LOOKAHEAD_RANGE.contains(&lookahead) {
                    return bad_parameter(
                        property,
                        format!("look-ahead must be 0 or within {:?}", LOOKAHEAD_RANGE),
                    );
                }
                self.lookahead = lookahead;
            }
            PropertyValue::TwoPass(two_pass) => self.two_pass = two_pass,
            PropertyValue::Sei(sei) => self.sei = sei,
            PropertyValue::RateControlPlugin(false) => (),
            PropertyValue::RateControlPlugin(true) => {
                return Err(SettingsError::NotImplemented(property))
            }
            PropertyValue::Crop(crop) => {
                if !crop.fits(self.resolution) {
                    return bad_parameter(
                        property,
                        format!("{} does not fit in {}", crop, self.resolution),
                    );
                }
                self.crop = crop;
            }
            PropertyValue::SeparateConfiguration(separate) => {
                self.separate_configuration = separate
            }
            PropertyValue::SubframeLatency(subframe) => self.subframe_latency = subframe,
            PropertyValue::LoopFilter(filter) => {
                if !LoopFilter::OFFSET_RANGE.contains(&filter.beta_offset)
                    || !LoopFilter::OFFSET_RANGE.contains(&filter.tc_offset)
                {
                    return bad_parameter(property, "loop filter offsets out of range");
                }
                self.loop_filter = filter;
            }
            PropertyValue::CopyOnDisplay(_) => return Err(SettingsError::BadIndex(property)),
        }
        Ok(())
    }
}
