//! Driver for the `xvsfsync` character device exposed by the Xilinx
//! synchronization IP kernel driver.
#![allow(non_camel_case_types)]

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::path::Path;
use std::time::Duration;

use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::driver::*;
use super::{ChannelErrors, SyncError};

/// Version of the ioctl structures, checked by the kernel driver.
const HEADER_VERSION: u32 = 0x0001_0000;

/// Configuration of one frame buffer slot. Arrays are indexed by role
/// (`PRODUCER`, `CONSUMER`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct xlnxsync_chan_config {
    pub luma_start_offset: [u64; 2],
    pub chroma_start_offset: [u64; 2],
    pub luma_end_offset: [u64; 2],
    pub chroma_end_offset: [u64; 2],
    pub luma_margin: u32,
    pub chroma_margin: u32,
    pub ismono: [u8; 2],
    pub fb_id: [u8; 2],
    pub channel_id: u8,
    pub reserved0: [u8; 3],
    pub hdr_ver: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct xlnxsync_clr_err {
    pub channel_id: u8,
    pub sync_err: u8,
    pub wdg_err: u8,
    pub ldiff_err: u8,
    pub cdiff_err: u8,
    pub reserved0: [u8; 3],
    pub hdr_ver: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct xlnxsync_config {
    pub encode: u8,
    pub max_channels: u8,
    pub reserved0: [u8; 2],
    pub hdr_ver: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct xlnxsync_stat {
    pub fbdone: [[[u8; 2]; BUFFERS_PER_CHANNEL]; MAX_CHANNELS],
    pub enable: [u8; MAX_CHANNELS],
    pub sync_err: [u8; MAX_CHANNELS],
    pub wdg_err: [u8; MAX_CHANNELS],
    pub ldiff_err: [u8; MAX_CHANNELS],
    pub cdiff_err: [u8; MAX_CHANNELS],
    pub hdr_ver: u32,
    pub reserved: [u32; 8],
}

#[doc(hidden)]
mod ioctl {
    use super::*;

    nix::ioctl_read!(xlnxsync_get_cfg, b'X', 1, xlnxsync_config);
    nix::ioctl_read!(xlnxsync_chan_get_status, b'X', 2, xlnxsync_stat);
    nix::ioctl_write_ptr!(xlnxsync_chan_set_config, b'X', 3, xlnxsync_chan_config);
    nix::ioctl_write_int_bad!(xlnxsync_chan_enable, nix::request_code_none!(b'X', 4));
    nix::ioctl_write_int_bad!(xlnxsync_chan_disable, nix::request_code_none!(b'X', 5));
    nix::ioctl_write_ptr!(xlnxsync_clr_chan_err, b'X', 6, xlnxsync_clr_err);
    nix::ioctl_read!(xlnxsync_reserve_get_chan_id, b'X', 7, u8);
}

impl From<&BufferDescriptor> for xlnxsync_chan_config {
    fn from(d: &BufferDescriptor) -> Self {
        // Producer and consumer share the same frame buffer.
        xlnxsync_chan_config {
            luma_start_offset: [d.luma.start; 2],
            chroma_start_offset: [d.chroma.start; 2],
            luma_end_offset: [d.luma.end; 2],
            chroma_end_offset: [d.chroma.end; 2],
            luma_margin: d.luma_margin,
            chroma_margin: d.chroma_margin,
            ismono: [d.monochrome as u8; 2],
            fb_id: [d.fb; 2],
            channel_id: d.channel,
            hdr_ver: HEADER_VERSION,
            ..Default::default()
        }
    }
}

impl From<&xlnxsync_stat> for SyncStatus {
    fn from(stat: &xlnxsync_stat) -> Self {
        let mut status = SyncStatus::default();
        for (i, channel) in status.channels.iter_mut().enumerate() {
            *channel = ChannelSnapshot {
                fb_done: stat.fbdone[i],
                enable: stat.enable[i],
                sync_err: stat.sync_err[i],
                wdg_err: stat.wdg_err[i],
                ldiff_err: stat.ldiff_err[i],
                cdiff_err: stat.cdiff_err[i],
            };
        }
        status
    }
}

fn clear_request(channel: u8, errors: ChannelErrors) -> xlnxsync_clr_err {
    let flag = |e| errors.contains(e) as u8;
    xlnxsync_clr_err {
        channel_id: channel,
        sync_err: flag(ChannelErrors::SYNC),
        wdg_err: flag(ChannelErrors::WATCHDOG),
        ldiff_err: flag(ChannelErrors::LUMA_DIFF),
        cdiff_err: flag(ChannelErrors::CHROMA_DIFF),
        hdr_ver: HEADER_VERSION,
        ..Default::default()
    }
}

/// A sync IP instance, opened from its device node (e.g. `/dev/xvsfsync0`).
pub struct XvsfsyncDriver {
    file: File,
}

impl XvsfsyncDriver {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;

        let fd = open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        debug!("Opened sync device {}", path.display());
        // Safe because `open` just returned this descriptor to us.
        Ok(XvsfsyncDriver {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }
}

impl SyncDriver for XvsfsyncDriver {
    fn post(&self, message: SyncMessage) -> Result<SyncReply, SyncError> {
        let fd = self.file.as_raw_fd();

        match message {
            SyncMessage::GetConfig => {
                let mut config = xlnxsync_config {
                    hdr_ver: HEADER_VERSION,
                    ..Default::default()
                };
                unsafe { ioctl::xlnxsync_get_cfg(fd, &mut config) }?;
                Ok(SyncReply::Config(SyncConfig {
                    encoder: config.encode != 0,
                    max_channels: config.max_channels,
                }))
            }
            SyncMessage::GetStatus => {
                let mut stat = xlnxsync_stat {
                    hdr_ver: HEADER_VERSION,
                    ..Default::default()
                };
                unsafe { ioctl::xlnxsync_chan_get_status(fd, &mut stat) }?;
                Ok(SyncReply::Status(SyncStatus::from(&stat)))
            }
            SyncMessage::ReserveChannel => {
                let mut channel = 0u8;
                match unsafe { ioctl::xlnxsync_reserve_get_chan_id(fd, &mut channel) } {
                    Ok(_) => Ok(SyncReply::Channel(channel)),
                    Err(Errno::EBUSY) => Err(SyncError::NoFreeChannel),
                    Err(e) => Err(e.into()),
                }
            }
            // The driver ties reservations to the open file and frees them
            // when it is closed. There is no request to release one earlier.
            SyncMessage::ReleaseChannel(channel) => {
                debug!("Sync channel {} freed when the device is closed", channel);
                Ok(SyncReply::Done)
            }
            SyncMessage::SetChannelConfig(descriptor) => {
                let config = xlnxsync_chan_config::from(&descriptor);
                match unsafe { ioctl::xlnxsync_chan_set_config(fd, &config) } {
                    Ok(_) => Ok(SyncReply::Done),
                    Err(Errno::EBUSY) => Err(SyncError::NoFreeSlot(descriptor.channel)),
                    Err(Errno::EINVAL) if descriptor.channel as usize >= MAX_CHANNELS => {
                        Err(SyncError::InvalidChannel(descriptor.channel))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            SyncMessage::Enable(channel) => {
                unsafe { ioctl::xlnxsync_chan_enable(fd, channel as i32) }?;
                Ok(SyncReply::Done)
            }
            SyncMessage::Disable(channel) => {
                unsafe { ioctl::xlnxsync_chan_disable(fd, channel as i32) }?;
                Ok(SyncReply::Done)
            }
            SyncMessage::ClearErrors(channel, errors) => {
                let request = clear_request(channel, errors);
                unsafe { ioctl::xlnxsync_clr_chan_err(fd, &request) }?;
                Ok(SyncReply::Done)
            }
        }
    }

    fn poll(&self, timeout: Duration) -> Result<bool, SyncError> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLPRI)];
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLPRI))
                .unwrap_or(false)),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_from_descriptor() {
        let descriptor = BufferDescriptor {
            channel: 2,
            fb: 1,
            luma: PlaneRange {
                start: 0x1000_0000,
                end: 0x1000_ffff,
            },
            chroma: PlaneRange {
                start: 0x1001_0000,
                end: 0x1001_7fff,
            },
            luma_margin: 4,
            chroma_margin: 2,
            monochrome: false,
            buffer_id: 99,
        };
        let config = xlnxsync_chan_config::from(&descriptor);
        assert_eq!(config.channel_id, 2);
        assert_eq!(config.fb_id, [1, 1]);
        assert_eq!(config.luma_start_offset[PRODUCER], 0x1000_0000);
        assert_eq!(config.chroma_end_offset[CONSUMER], 0x1001_7fff);
        assert_eq!(config.ismono, [0, 0]);
        assert_eq!(config.hdr_ver, HEADER_VERSION);
    }

    #[test]
    fn status_from_stat() {
        let mut stat = xlnxsync_stat::default();
        stat.fbdone[1][2] = [1, 1];
        stat.enable[1] = 1;
        stat.wdg_err[3] = 1;
        let status = SyncStatus::from(&stat);
        assert_eq!(status.channels[1].fb_done[2], [1, 1]);
        assert_eq!(status.channels[1].enable, 1);
        assert_eq!(status.channels[3].wdg_err, 1);
        assert_eq!(status.channels[0], ChannelSnapshot::default());
    }

    #[test]
    fn clear_request_flags() {
        let request = clear_request(1, ChannelErrors::SYNC | ChannelErrors::CHROMA_DIFF);
        assert_eq!(
            (request.sync_err, request.wdg_err, request.ldiff_err, request.cdiff_err),
            (1, 0, 0, 1)
        );
    }
}
