// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`DecoderDevice`] backed by a V4L2 video node of the msm_vidc driver.
//!
//! Standard ioctls go through the safe wrappers of `v4l2r::ioctl`. The vendor extensions of the
//! driver are not covered by them: ion-backed USERPTR planes carry the allocation in the
//! reserved words of `v4l2_plane`, private events and controls use ids outside the typed sets of
//! `v4l2r`, and the flush is a vendor decoder command. Those ioctls are issued directly on the
//! `v4l2r` bindings.

use std::ffi::c_int;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::ioctl_read;
use nix::ioctl_readwrite;
use nix::ioctl_write_ptr;
use v4l2r::bindings::v4l2_buffer;
use v4l2r::bindings::v4l2_capability;
use v4l2r::bindings::v4l2_control;
use v4l2r::bindings::v4l2_decoder_cmd;
use v4l2r::bindings::v4l2_event;
use v4l2r::bindings::v4l2_event_subscription;
use v4l2r::bindings::v4l2_fmtdesc;
use v4l2r::bindings::v4l2_format;
use v4l2r::bindings::v4l2_plane;
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::bindings::v4l2_streamparm;
use v4l2r::ioctl;
use v4l2r::memory::MemoryType;

use crate::device::BufferDescriptor;
use crate::device::BufferFlags;
use crate::device::Capabilities;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceError;
use crate::device::FlushMask;
use crate::device::Format;
use crate::device::FormatDescription;
use crate::device::PlaneFormat;
use crate::device::QueueType;
use crate::device::RawEvent;
use crate::device::Timestamp;
use crate::device::DEC_QCOM_CMD_FLUSH;
use crate::utils::retry_on_interrupt;
use crate::Fourcc;
use crate::Resolution;

const V4L2_MEMORY_USERPTR: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;
const VIDEO_MAX_PLANES: usize = 8;

const IOCTL_VIDEO_COMMAND: u8 = b'V';

ioctl_readwrite!(vidioc_qbuf, IOCTL_VIDEO_COMMAND, 15, v4l2_buffer);
ioctl_readwrite!(vidioc_dqbuf, IOCTL_VIDEO_COMMAND, 17, v4l2_buffer);
ioctl_readwrite!(vidioc_s_ctrl, IOCTL_VIDEO_COMMAND, 28, v4l2_control);
ioctl_read!(vidioc_dqevent, IOCTL_VIDEO_COMMAND, 89, v4l2_event);
ioctl_write_ptr!(vidioc_subscribe_event, IOCTL_VIDEO_COMMAND, 90, v4l2_event_subscription);
ioctl_readwrite!(vidioc_decoder_cmd, IOCTL_VIDEO_COMMAND, 96, v4l2_decoder_cmd);

/// Error number carried by the errors of the `v4l2r` ioctl wrappers.
trait IoctlErrno {
    fn errno(self) -> Errno;
}

macro_rules! impl_ioctl_errno {
    ($($error:ident),*) => {
        $(
            impl IoctlErrno for ioctl::$error {
                fn errno(self) -> Errno {
                    match self {
                        ioctl::$error::IoctlError(errno) => Errno::from_raw(errno as i32),
                        // The remaining variants all stand for arguments the driver rejected.
                        #[allow(unreachable_patterns)]
                        _ => Errno::EINVAL,
                    }
                }
            }
        )*
    };
}

impl_ioctl_errno!(
    QueryCapError,
    EnumFmtError,
    GFmtError,
    SFmtError,
    ReqbufsError,
    StreamOnError,
    StreamOffError,
    GParmError
);

fn v4l2_queue(queue: QueueType) -> v4l2r::QueueType {
    match queue {
        QueueType::Capture => v4l2r::QueueType::VideoCaptureMplane,
        QueueType::Output => v4l2r::QueueType::VideoOutputMplane,
    }
}

fn parse_c_str_from_array(arr: &[u8]) -> String {
    let bytes: Vec<u8> = arr.iter().copied().take_while(|&c| c != 0).collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Fills a multiplanar `v4l2_format` for `queue` from `format`.
fn to_raw_format(queue: QueueType, format: &Format) -> v4l2_format {
    let mut raw = v4l2_format { type_: queue as u32, ..Default::default() };

    // SAFETY: `pix_mp` is the member of the union selected by multiplanar buffer types.
    let pix_mp = unsafe { &mut raw.fmt.pix_mp };
    pix_mp.width = format.resolution.width;
    pix_mp.height = format.resolution.height;
    pix_mp.pixelformat = format.fourcc.into();
    pix_mp.field = V4L2_FIELD_NONE;
    pix_mp.num_planes = queue.num_planes() as u8;
    for (raw_plane, plane) in pix_mp.plane_fmt.iter_mut().zip(&format.planes) {
        raw_plane.sizeimage = plane.size_image;
        raw_plane.bytesperline = plane.bytes_per_line;
    }

    raw
}

fn from_raw_format(raw: &v4l2_format) -> Format {
    // SAFETY: only multiplanar formats are ever requested from the device.
    let pix_mp = unsafe { &raw.fmt.pix_mp };
    let num_planes = (pix_mp.num_planes as usize).min(VIDEO_MAX_PLANES);

    Format {
        fourcc: Fourcc::from(pix_mp.pixelformat),
        resolution: Resolution { width: pix_mp.width, height: pix_mp.height },
        planes: pix_mp.plane_fmt[..num_planes]
            .iter()
            .map(|plane| PlaneFormat {
                size_image: plane.sizeimage,
                bytes_per_line: plane.bytesperline,
                // The driver reports the padded height of the plane here.
                scanlines: plane.reserved[0] as u32,
            })
            .collect(),
    }
}

fn to_raw_plane(plane: &crate::device::PlaneDescriptor) -> v4l2_plane {
    let mut raw = v4l2_plane {
        bytesused: plane.bytes_used,
        length: plane.length,
        data_offset: 0,
        ..Default::default()
    };
    raw.m.userptr = plane.base_addr as _;
    // The driver locates USERPTR planes inside the ion allocation through these two fields.
    raw.reserved[0] = plane.fd as u32;
    raw.reserved[1] = plane.offset;
    raw
}

/// Decoder exposed by the kernel as a V4L2 video node.
pub struct V4l2Device {
    file: File,
}

impl V4l2Device {
    /// Opens the video node at `path` in non-blocking mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| DeviceError::Open(path.display().to_string(), e))?;

        log::debug!("opened video decoder {}", path.display());

        Ok(Self { file })
    }

    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl DecoderDevice for V4l2Device {
    fn capabilities(&mut self) -> Result<Capabilities, DeviceError> {
        let cap: v4l2_capability =
            retry_on_interrupt(|| ioctl::querycap(&self.file).map_err(IoctlErrno::errno))
                .map_err(|e| DeviceError::ioctl("VIDIOC_QUERYCAP", e))?;

        let device_caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };

        Ok(Capabilities {
            driver: parse_c_str_from_array(&cap.driver),
            card: parse_c_str_from_array(&cap.card),
            bus_info: parse_c_str_from_array(&cap.bus_info),
            version: cap.version,
            device_caps,
        })
    }

    fn enum_formats(&mut self, queue: QueueType) -> Result<Vec<FormatDescription>, DeviceError> {
        let mut formats = Vec::new();

        for index in 0.. {
            let desc: nix::Result<v4l2_fmtdesc> = retry_on_interrupt(|| {
                ioctl::enum_fmt(&self.file, v4l2_queue(queue), index).map_err(IoctlErrno::errno)
            });
            match desc {
                Ok(desc) => formats.push(FormatDescription {
                    fourcc: Fourcc::from(desc.pixelformat),
                    description: parse_c_str_from_array(&desc.description),
                }),
                // The end of the list is signaled with EINVAL.
                Err(Errno::EINVAL) => break,
                Err(e) => return Err(DeviceError::ioctl("VIDIOC_ENUM_FMT", e)),
            }
        }

        Ok(formats)
    }

    fn set_format(&mut self, queue: QueueType, format: &Format) -> Result<Format, DeviceError> {
        let raw: v4l2_format = retry_on_interrupt(|| {
            ioctl::s_fmt(&mut self.file, to_raw_format(queue, format)).map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_S_FMT", e))?;

        Ok(from_raw_format(&raw))
    }

    fn get_format(&mut self, queue: QueueType) -> Result<Format, DeviceError> {
        let raw: v4l2_format = retry_on_interrupt(|| {
            ioctl::g_fmt(&self.file, v4l2_queue(queue)).map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_G_FMT", e))?;

        Ok(from_raw_format(&raw))
    }

    fn request_buffers(&mut self, queue: QueueType, count: u32) -> Result<u32, DeviceError> {
        let reqbuf: v4l2_requestbuffers = retry_on_interrupt(|| {
            ioctl::reqbufs(&self.file, v4l2_queue(queue), MemoryType::UserPtr, count)
                .map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_REQBUFS", e))?;

        Ok(reqbuf.count)
    }

    fn stream_on(&mut self, queue: QueueType) -> Result<(), DeviceError> {
        retry_on_interrupt(|| {
            ioctl::streamon(&self.file, v4l2_queue(queue)).map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_STREAMON", e))
    }

    fn stream_off(&mut self, queue: QueueType) -> Result<(), DeviceError> {
        retry_on_interrupt(|| {
            ioctl::streamoff(&self.file, v4l2_queue(queue)).map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_STREAMOFF", e))
    }

    fn queue_buffer(
        &mut self,
        queue: QueueType,
        buffer: &BufferDescriptor,
    ) -> Result<(), DeviceError> {
        let mut planes: Vec<v4l2_plane> = buffer.planes.iter().map(to_raw_plane).collect();

        let mut raw = v4l2_buffer {
            index: buffer.index,
            type_: queue as u32,
            flags: buffer.flags.bits(),
            memory: V4L2_MEMORY_USERPTR,
            length: planes.len() as u32,
            ..Default::default()
        };
        raw.timestamp.tv_sec = buffer.timestamp.secs() as _;
        raw.timestamp.tv_usec = buffer.timestamp.subsec_micros() as _;
        raw.m.planes = planes.as_mut_ptr();

        // SAFETY: `raw` points to `planes`, which has `raw.length` entries and outlives the call.
        retry_on_interrupt(|| unsafe { vidioc_qbuf(self.fd(), &mut raw) })
            .map_err(|e| DeviceError::ioctl("VIDIOC_QBUF", e))?;

        Ok(())
    }

    fn dequeue_buffer(&mut self, queue: QueueType) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let mut planes = [v4l2_plane::default(); 2];
        let num_planes = queue.num_planes();

        let mut raw = v4l2_buffer {
            type_: queue as u32,
            memory: V4L2_MEMORY_USERPTR,
            length: num_planes as u32,
            ..Default::default()
        };
        raw.m.planes = planes.as_mut_ptr();

        // SAFETY: `raw` points to `planes`, which has at least `raw.length` entries and outlives
        // the call.
        match retry_on_interrupt(|| unsafe { vidioc_dqbuf(self.fd(), &mut raw) }) {
            Ok(_) => (),
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(DeviceError::ioctl("VIDIOC_DQBUF", e)),
        }

        Ok(Some(DequeuedBuffer {
            index: raw.index,
            bytes_used: planes[0].bytesused,
            flags: BufferFlags(raw.flags),
            timestamp: Timestamp::from_parts(raw.timestamp.tv_sec as _, raw.timestamp.tv_usec as _),
        }))
    }

    fn set_control(&mut self, control: Control) -> Result<(), DeviceError> {
        let mut raw = v4l2_control { id: control.id, value: control.value };
        // SAFETY: `raw` is a valid `v4l2_control` that outlives the call.
        retry_on_interrupt(|| unsafe { vidioc_s_ctrl(self.fd(), &mut raw) })
            .map_err(|e| DeviceError::ioctl("VIDIOC_S_CTRL", e))?;
        Ok(())
    }

    fn set_frame_period(
        &mut self,
        queue: QueueType,
        numerator: u32,
        denominator: u32,
    ) -> Result<(), DeviceError> {
        let mut parm = v4l2_streamparm { type_: queue as u32, ..Default::default() };

        // SAFETY: the member of the union matching the queue direction is selected.
        unsafe {
            match queue {
                QueueType::Output => {
                    parm.parm.output.timeperframe.numerator = numerator;
                    parm.parm.output.timeperframe.denominator = denominator;
                }
                QueueType::Capture => {
                    parm.parm.capture.timeperframe.numerator = numerator;
                    parm.parm.capture.timeperframe.denominator = denominator;
                }
            }
        }

        retry_on_interrupt(|| {
            ioctl::s_parm::<_, v4l2_streamparm>(&self.file, parm).map_err(IoctlErrno::errno)
        })
        .map_err(|e| DeviceError::ioctl("VIDIOC_S_PARM", e))?;

        log::debug!("{queue}: time per frame set to {numerator}/{denominator}");
        Ok(())
    }

    fn subscribe_event(&mut self, kind: u32) -> Result<(), DeviceError> {
        let sub = v4l2_event_subscription { type_: kind, ..Default::default() };
        // SAFETY: `sub` is a valid `v4l2_event_subscription` that outlives the call.
        retry_on_interrupt(|| unsafe { vidioc_subscribe_event(self.fd(), &sub) })
            .map_err(|e| DeviceError::ioctl("VIDIOC_SUBSCRIBE_EVENT", e))?;
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<RawEvent>, DeviceError> {
        let mut raw = v4l2_event::default();
        // SAFETY: `raw` is a valid `v4l2_event` that outlives the call.
        match retry_on_interrupt(|| unsafe { vidioc_dqevent(self.fd(), &mut raw) }) {
            Ok(_) => (),
            // No pending event.
            Err(Errno::EAGAIN | Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(DeviceError::ioctl("VIDIOC_DQEVENT", e)),
        }

        // SAFETY: every member of the union is plain data, `data` covers all of it.
        let data = unsafe { raw.u.data };

        Ok(Some(RawEvent { kind: raw.type_, sequence: raw.sequence, data }))
    }

    fn flush(&mut self, mask: FlushMask) -> Result<(), DeviceError> {
        let mut cmd =
            v4l2_decoder_cmd { cmd: DEC_QCOM_CMD_FLUSH, flags: mask.0, ..Default::default() };
        // SAFETY: `cmd` is a valid `v4l2_decoder_cmd` that outlives the call.
        retry_on_interrupt(|| unsafe { vidioc_decoder_cmd(self.fd(), &mut cmd) })
            .map_err(|e| DeviceError::ioctl("VIDIOC_DECODER_CMD", e))?;

        log::debug!("flush requested for {mask:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlaneDescriptor;
    use crate::NV12_FOURCC;

    #[test]
    fn c_strings() {
        assert_eq!(parse_c_str_from_array(b"msm_vidc_driver\0\0\0"), "msm_vidc_driver");
        assert_eq!(parse_c_str_from_array(b"no terminator"), "no terminator");
        assert_eq!(parse_c_str_from_array(&[0; 16]), "");
    }

    #[test]
    fn format_conversion() {
        let mut format = Format::new(NV12_FOURCC, Resolution { width: 1920, height: 1080 });
        format.planes.push(PlaneFormat { size_image: 4096, ..Default::default() });

        let mut raw = to_raw_format(QueueType::Capture, &format);
        assert_eq!(raw.type_, QueueType::Capture as u32);

        // Emulate the driver filling in the layout.
        unsafe {
            raw.fmt.pix_mp.plane_fmt[0].bytesperline = 1920;
            raw.fmt.pix_mp.plane_fmt[0].reserved[0] = 1088;
            raw.fmt.pix_mp.plane_fmt[1].sizeimage = 8192;
        }

        let back = from_raw_format(&raw);
        assert_eq!(back.fourcc, NV12_FOURCC);
        assert_eq!(back.resolution, format.resolution);
        assert_eq!(
            back.planes,
            vec![
                PlaneFormat { size_image: 4096, bytes_per_line: 1920, scanlines: 1088 },
                PlaneFormat { size_image: 8192, ..Default::default() },
            ]
        );
    }

    #[test]
    fn queue_types_match_bindings() {
        for queue in [QueueType::Capture, QueueType::Output] {
            assert_eq!(v4l2_queue(queue) as u32, queue as u32);
        }
        assert_eq!(Errno::EBUSY, ioctl::StreamOnError::IoctlError(v4l2r::nix::errno::Errno::EBUSY).errno());
    }

    #[test]
    fn userptr_plane() {
        let plane = PlaneDescriptor {
            fd: 7,
            base_addr: 0x1000,
            offset: 0x200,
            length: 0x100,
            bytes_used: 0x80,
        };
        let raw = to_raw_plane(&plane);
        assert_eq!(unsafe { raw.m.userptr }, 0x1000);
        assert_eq!(raw.reserved[0], 7);
        assert_eq!(raw.reserved[1], 0x200);
        assert_eq!((raw.length, raw.bytesused, raw.data_offset), (0x100, 0x80, 0));
    }

    #[test]
    fn open_missing_node() {
        assert!(matches!(
            V4l2Device::open("/nonexistent/video32"),
            Err(DeviceError::Open(path, _)) if path == "/nonexistent/video32"
        ));
    }
}
