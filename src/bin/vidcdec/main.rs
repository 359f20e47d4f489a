// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vidcdec, a simple decoder program for Qualcomm V4L2 decoders. Capable of computing MD5
//! checksums from the input and writing the raw decoded frames to a file.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;

use vidc_decode::allocator::IonAllocator;
use vidc_decode::bitstream_utils::AnnexBSource;
use vidc_decode::bitstream_utils::BitstreamSource;
use vidc_decode::bitstream_utils::IvfSource;
use vidc_decode::device::v4l2::V4l2Device;
use vidc_decode::image_processing::FormatConverter;
use vidc_decode::image_processing::Nv12Linearizer;
use vidc_decode::scheduler::EpollPoller;
use vidc_decode::scheduler::EventScheduler;
use vidc_decode::scheduler::StopReason;
use vidc_decode::session::DecodeSession;
use vidc_decode::session::DecodedFrame;
use vidc_decode::session::FrameSink;
use vidc_decode::session::SessionConfig;
use vidc_decode::EncodedFormat;

use crate::util::is_matroska;
use crate::util::Args;
use crate::util::Md5Computation;
use crate::util::MkvSource;

mod util;

/// Linearizes decoded frames, then writes and hashes them as requested on the command line.
struct OutputSink {
    converter: Nv12Linearizer,
    nv12: Vec<u8>,
    output: Option<BufWriter<File>>,
    compute_md5: Option<Md5Computation>,
    md5_context: md5::Context,
    frame_crc: bool,
    frames: u64,
}

impl OutputSink {
    fn new(args: &Args) -> anyhow::Result<Self> {
        let output = match &args.output {
            Some(path) => Some(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("error creating output file {}", path.display()))?,
            )),
            None => None,
        };

        Ok(Self {
            converter: Nv12Linearizer,
            nv12: Vec::new(),
            output,
            compute_md5: args.compute_md5,
            md5_context: md5::Context::new(),
            frame_crc: args.frame_crc,
            frames: 0,
        })
    }

    fn needs_data(&self) -> bool {
        self.output.is_some() || self.compute_md5.is_some() || self.frame_crc
    }

    fn finish(mut self) -> anyhow::Result<()> {
        if let Some(output) = &mut self.output {
            output.flush().context("failed to flush output file")?;
        }

        if let Some(Md5Computation::Stream) = self.compute_md5 {
            println!("{:x}", self.md5_context.compute());
        }

        log::info!("{} frames decoded", self.frames);
        Ok(())
    }
}

impl FrameSink for OutputSink {
    fn deliver(&mut self, frame: &DecodedFrame<'_>) -> anyhow::Result<()> {
        self.frames += 1;
        log::debug!(
            "frame {}: buffer {} pts {} {:?}",
            self.frames,
            frame.index,
            frame.pts,
            frame.layout.resolution
        );

        if !self.needs_data() {
            return Ok(());
        }

        self.converter.convert(frame.data, frame.layout, &mut self.nv12)?;

        if let Some(output) = &mut self.output {
            output.write_all(&self.nv12).context("failed to write to output file")?;
        }

        match self.compute_md5 {
            None => (),
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&self.nv12)),
            Some(Md5Computation::Stream) => self.md5_context.consume(&self.nv12),
        }

        if self.frame_crc {
            println!("{:08x}", crc32fast::hash(&self.nv12));
        }

        Ok(())
    }
}

fn create_source(args: &Args, input: Vec<u8>) -> anyhow::Result<Box<dyn BitstreamSource>> {
    let frame_rate = args.frame_rate.map(|rate| (rate.0, rate.1));

    Ok(match args.input_format {
        EncodedFormat::H264 | EncodedFormat::H265 => {
            Box::new(AnnexBSource::new(input, args.input_format, frame_rate)?)
        }
        EncodedFormat::VP8 | EncodedFormat::VP9 if is_matroska(&input) => {
            Box::new(MkvSource::new(input, frame_rate)?)
        }
        EncodedFormat::VP8 | EncodedFormat::VP9 => Box::new(IvfSource::new(input)?),
    })
}

fn run(args: Args) -> anyhow::Result<StopReason> {
    let input = std::fs::read(&args.input)
        .with_context(|| format!("error reading input file {}", args.input.display()))?;
    let mut source = create_source(&args, input)?;
    let mut sink = OutputSink::new(&args)?;

    let config = SessionConfig {
        format: args.input_format,
        frame_rate: args.frame_rate.map(|rate| (rate.0, rate.1)),
        decode_order: args.decode_order,
        skip_frames: args.skip_frames,
        ..Default::default()
    };

    let allocator = IonAllocator::open(&args.ion_device)?;
    let device = V4l2Device::open(&args.device)?;
    let poller = EpollPoller::new(&device, config.poll_timeout)?;

    let mut session = DecodeSession::new(device, &allocator, config);
    session.start().context("failed to start decoding session")?;

    let mut scheduler = EventScheduler::new(poller);
    let reason = scheduler.run(&mut session, &mut source, &mut sink)?;

    if session.dropped_units() > 0 {
        log::warn!("{} units did not fit in an input buffer", session.dropped_units());
    }
    session.stop()?;
    sink.finish()?;

    Ok(reason)
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Args = argh::from_env();

    match run(args) {
        Ok(StopReason::StreamEnd) => ExitCode::SUCCESS,
        Ok(StopReason::Stalled) => {
            log::error!("decoder never returned the end of stream");
            ExitCode::FAILURE
        }
        Ok(StopReason::Interrupted) => {
            log::warn!("decoding interrupted");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
