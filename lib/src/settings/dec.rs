use log::debug;

use super::*;

/// Configuration of a decoder module.
///
/// The stream properties (`resolution`, `format`, output buffer requirements)
/// start with client-provided defaults and are overwritten once by the values
/// the hardware parsed from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecSettings {
    pub codec: Codec,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride_alignment: Stride,
    pub clock: Clock,
    buffer_counts: BufferCounts,
    min_output_buffers: u32,
    input_buffer_size: usize,
    pub handles: BufferHandleTypes,
    pub sei: SeiFlags,
    pub crop: Rect,
    pub subframe_latency: bool,
    copy_on_display: bool,
}

impl Default for DecSettings {
    fn default() -> Self {
        let resolution = Resolution::new(1920, 1080);
        DecSettings {
            codec: Codec::default(),
            resolution,
            format: PixelFormat::NV12,
            stride_alignment: Stride {
                horizontal: 64,
                vertical: 64,
            },
            clock: Clock::default(),
            buffer_counts: BufferCounts {
                input: 2,
                output: 4,
            },
            min_output_buffers: 4,
            input_buffer_size: 1024 * 1024,
            handles: BufferHandleTypes::default(),
            sei: SeiFlags::empty(),
            crop: Rect::new(0, 0, resolution.width, resolution.height),
            subframe_latency: false,
            copy_on_display: false,
        }
    }
}

impl DecSettings {
    /// Layout of decoded pictures.
    pub fn stride(&self) -> Stride {
        Stride::for_picture(self.resolution, self.format, self.stride_alignment).unwrap_or_default()
    }

    pub fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes {
            input: self.input_buffer_size,
            output: self.stride().picture_size(self.format).unwrap_or(0),
        }
    }

    pub fn buffer_counts(&self) -> BufferCounts {
        BufferCounts {
            input: self.buffer_counts.input.max(2),
            output: self.buffer_counts.output.max(self.min_output_buffers),
        }
    }

    /// Whether decoded pictures are copied into the client buffer on display
    /// instead of being decoded in place.
    pub fn copy_on_display(&self) -> bool {
        self.copy_on_display
    }

    /// Records the properties of the stream found by the hardware.
    pub fn latch_stream(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
        min_output_buffers: u32,
        crop: Rect,
    ) {
        debug!(
            "Decoder stream: {} {} ({} buffers, crop {})",
            resolution, format, min_output_buffers, crop
        );
        self.resolution = resolution;
        self.format = format;
        self.min_output_buffers = min_output_buffers;
        self.crop = crop;
    }
}

impl MediaSettings for DecSettings {
    fn get(&self, property: Property) -> SettingsResult<PropertyValue> {
        Ok(match property {
            Property::Codec => PropertyValue::Codec(self.codec),
            Property::Resolution => PropertyValue::Resolution(self.resolution),
            Property::Format => PropertyValue::Format(self.format),
            Property::StrideAlignment => PropertyValue::StrideAlignment(self.stride_alignment),
            Property::Clock => PropertyValue::Clock(self.clock),
            Property::BufferCounts => PropertyValue::BufferCounts(self.buffer_counts()),
            Property::BufferSizes => PropertyValue::BufferSizes(self.buffer_sizes()),
            Property::BufferHandles => PropertyValue::BufferHandles(self.handles),
            Property::Sei => PropertyValue::Sei(self.sei),
            Property::Crop => PropertyValue::Crop(self.crop),
            Property::SubframeLatency => PropertyValue::SubframeLatency(self.subframe_latency),
            Property::CopyOnDisplay => PropertyValue::CopyOnDisplay(self.copy_on_display),
            Property::Bitrate
            | Property::Gop
            | Property::LookAhead
            | Property::TwoPass
            | Property::RateControlPlugin
            | Property::SeparateConfiguration
            | Property::LoopFilter => return Err(SettingsError::BadIndex(property)),
        })
    }

    fn set(&mut self, value: PropertyValue) -> SettingsResult<()> {
        let property = value.property();
        debug!("Decoder settings: {:?}", value);
        match value {
            PropertyValue::Codec(codec) => self.codec = codec,
            PropertyValue::Resolution(resolution) => {
                check_resolution(resolution, self.format)?;
                self.resolution = resolution;
                self.crop = Rect::new(0, 0, resolution.width, resolution.height);
            }
            PropertyValue::Format(format) => {
                check_format(format)?;
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
            PropertyValue::BufferCounts(counts) => {
                if counts.input < 2 || counts.output < self.min_output_buffers {
                    return bad_parameter(
                        property,
                        format!(
                            "at least 2 input and {} output buffers are needed",
                            self.min_output_buffers
                        ),
                    );
                }
                self.buffer_counts = counts;
            }
            PropertyValue::BufferSizes(sizes) => {
                // Only the bitstream buffer size is up to the client.
                if sizes.input == 0 {
                    return bad_parameter(property, "input buffers cannot be empty");
                }
                self.input_buffer_size = sizes.input;
            }
            PropertyValue::BufferHandles(handles) => {
                if self.copy_on_display && handles.output != HandleType::Memory {
                    return bad_parameter(
                        property,
                        "copy on display requires memory output buffers",
                    );
                }
                self.handles = handles;
            }
            PropertyValue::Sei(sei) => self.sei = sei,
            PropertyValue::Crop(crop) => {
                if !crop.fits(self.resolution) {
                    return bad_parameter(
                        property,
                        format!("{} does not fit in {}", crop, self.resolution),
                    );
                }
                self.crop = crop;
            }
            PropertyValue::SubframeLatency(subframe) => self.subframe_latency = subframe,
            PropertyValue::CopyOnDisplay(copy) => {
                if copy && self.handles.output != HandleType::Memory {
                    return bad_parameter(
                        property,
                        "copy on display requires memory output buffers",
                    );
                }
                self.copy_on_display = copy;
            }
            PropertyValue::Bitrate(_)
            | PropertyValue::Gop(_)
            | PropertyValue::LookAhead(_)
            | PropertyValue::TwoPass(_)
            | PropertyValue::RateControlPlugin(_)
            | PropertyValue::SeparateConfiguration(_)
            | PropertyValue::LoopFilter(_) => return Err(SettingsError::BadIndex(property)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_only_properties() {
        let mut settings = DecSettings::default();
        for property in [Property::Bitrate, Property::LookAhead, Property::LoopFilter] {
            assert_eq!(settings.get(property), Err(SettingsError::BadIndex(property)));
        }
        assert_eq!(
            settings.set(PropertyValue::TwoPass(true)),
            Err(SettingsError::BadIndex(Property::TwoPass))
        );
    }

    #[test]
    fn copy_on_display_needs_memory_output() {
        let mut settings = DecSettings::default();
        settings.set(PropertyValue::CopyOnDisplay(true)).unwrap();
        assert!(settings.copy_on_display());

        let dmabuf_output = BufferHandleTypes {
            input: HandleType::Memory,
            output: HandleType::DmaBuf,
        };
        assert!(settings
            .set(PropertyValue::BufferHandles(dmabuf_output))
            .is_err());

        settings.set(PropertyValue::CopyOnDisplay(false)).unwrap();
        settings
            .set(PropertyValue::BufferHandles(dmabuf_output))
            .unwrap();
        assert!(settings.set(PropertyValue::CopyOnDisplay(true)).is_err());
    }

    #[test]
    fn latched_stream_sets_requirements() {
        let mut settings = DecSettings::default();
        settings.latch_stream(
            Resolution::new(1280, 720),
            PixelFormat::NV12,
            7,
            Rect::new(0, 0, 1280, 720),
        );

        assert_eq!(settings.buffer_counts().output, 7);
        assert_eq!(settings.stride().vertical, 768);
        assert_eq!(settings.buffer_sizes().output, 1280 * (768 + 384));
        assert!(settings
            .set(PropertyValue::BufferCounts(BufferCounts {
                input: 2,
                output: 6
            }))
            .is_err());
    }
}
