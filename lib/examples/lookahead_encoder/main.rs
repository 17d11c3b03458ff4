use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Arg, Command};
use log::warn;
use vcumod::device::dummy::{DummyConfig, DummyDevice};
use vcumod::encoder::EncModule;
use vcumod::memory::{BufferFlags, BufferHandle};
use vcumod::module::{Callbacks, Dynamic, Event, Module, Roi};
use vcumod::settings::{
    BufferCounts, BufferSizes, EncSettings, MediaSettings, Property, PropertyValue,
};
use vcumod::{Rect, Resolution};
use vcumod_utils::framegen::FrameGenerator;

enum Message {
    InputDone(Arc<BufferHandle>),
    Encoded(Arc<BufferHandle>, usize),
    EndOfStream,
    Event(Event),
}

/// Forwards the encoder callbacks to the main loop.
struct Client(Mutex<mpsc::Sender<Message>>);

impl Client {
    fn send(&self, message: Message) {
        let _ = self.0.lock().unwrap().send(message);
    }
}

impl Callbacks for Client {
    fn emptied(&self, handle: Arc<BufferHandle>) {
        self.send(Message::InputDone(handle));
    }

    fn associate(&self, _input: Arc<BufferHandle>, _output: Arc<BufferHandle>) {}

    fn filled(&self, handle: Option<Arc<BufferHandle>>, offset: usize, payload: usize) {
        match handle {
            Some(handle) => {
                handle.set_offset(offset);
                self.send(Message::Encoded(handle, payload));
            }
            None => self.send(Message::EndOfStream),
        }
    }

    fn release(&self, _is_input: bool, _handle: Arc<BufferHandle>) {}

    fn event(&self, event: Event) {
        self.send(Message::Event(event));
    }
}

fn main() {
    env_logger::init();

    let matches = Command::new("Look-ahead encoder")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .default_value("120")
                .help("Stop after encoding a given number of frames"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to encode (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("lookahead")
                .long("lookahead")
                .takes_value(true)
                .default_value("8")
                .help("Number of frames analyzed ahead of the final pass, 0 to disable"),
        )
        .arg(
            Arg::new("latency")
                .long("latency")
                .takes_value(true)
                .default_value("2")
                .help("Time spent by the dummy hardware on each frame, in milliseconds"),
        )
        .arg(
            Arg::new("separate_config")
                .long("separate_config")
                .help("Deliver parameter sets in their own buffers"),
        )
        .arg(
            Arg::new("roi")
                .long("roi")
                .help("Encode the center of the picture with a better quality"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .takes_value(true)
                .help("Save the encoded stream to a file"),
        )
        .get_matches();

    let parse = |name: &str| -> u32 {
        matches
            .value_of(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| panic!("Invalid value for {}", name))
    };
    let num_frames = parse("num_frames");
    let lookahead = parse("lookahead");
    let latency = Duration::from_millis(parse("latency") as u64);

    let resolution = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: u32 = split[0].parse().expect(ERROR_MSG);
            let height: u32 = split[1].parse().expect(ERROR_MSG);
            Resolution::new(width, height)
        })
        .unwrap();

    let mut output_file = matches
        .value_of("output_file")
        .map(|s| File::create(s).expect("Invalid output file specified."));

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let mut settings = EncSettings::default();
    settings
        .set(PropertyValue::Resolution(resolution))
        .expect("Unsupported frame size");
    settings
        .set(PropertyValue::LookAhead(lookahead))
        .expect("Unsupported look-ahead");
    settings
        .set(PropertyValue::SeparateConfiguration(
            matches.is_present("separate_config"),
        ))
        .unwrap();
    let stride = settings.stride();

    let device = Arc::new(DummyDevice::new(DummyConfig {
        latency,
        ..Default::default()
    }));
    let encoder = EncModule::new(device, settings);
    let (sender, receiver) = mpsc::channel();
    encoder
        .set_callbacks(Arc::new(Client(Mutex::new(sender))))
        .unwrap();
    encoder.create().expect("Failed to create encoder");
    encoder.run().expect("Failed to start encoder");

    let counts = match encoder.get(Property::BufferCounts) {
        Ok(PropertyValue::BufferCounts(counts)) => counts,
        _ => BufferCounts::default(),
    };
    let sizes = match encoder.get(Property::BufferSizes) {
        Ok(PropertyValue::BufferSizes(sizes)) => sizes,
        _ => BufferSizes::default(),
    };
    println!(
        "Configured encoder for {} ({} bytes per line), {} inputs and {} outputs",
        resolution, stride.horizontal, counts.input, counts.output
    );

    if matches.is_present("roi") {
        let rect = Rect::new(
            resolution.width / 4,
            resolution.height / 4,
            resolution.width / 2,
            resolution.height / 2,
        );
        encoder
            .set_dynamic(Dynamic::AddRoi(Roi { rect, qp_delta: -6 }))
            .expect("Failed to add region of interest");
    }

    let mut frame_gen = FrameGenerator::new(
        resolution.width as usize,
        stride.vertical as usize,
        stride.horizontal as usize,
    )
    .expect("Failed to create frame generator");
    let mut frame = vec![0u8; sizes.input.max(frame_gen.frame_size())];

    let mut free_inputs: Vec<_> = (0..counts.input)
        .map(|_| BufferHandle::alloc(sizes.input))
        .collect();
    for _ in 0..counts.output {
        encoder
            .fill(BufferHandle::alloc(sizes.output))
            .expect("Failed to queue output buffer");
    }

    let start_time = Instant::now();
    let mut submitted = 0u32;
    let mut encoded = 0u32;
    let mut total_size = 0usize;
    let mut eos_sent = false;
    loop {
        while !eos_sent {
            if submitted == num_frames || lets_quit.load(Ordering::SeqCst) {
                encoder
                    .empty(BufferHandle::alloc(16))
                    .expect("Failed to request end of stream");
                eos_sent = true;
                break;
            }
            let Some(input) = free_inputs.pop() else {
                break;
            };
            frame_gen
                .next_frame(&mut frame)
                .expect("Failed to generate frame");
            input
                .mapping()
                .and_then(|m| m.write_at(0, &frame[..sizes.input]))
                .expect("Failed to write input frame");
            input.set_payload(sizes.input);
            if matches.is_present("roi") {
                encoder
                    .set_dynamic(Dynamic::FillRoiBuffer)
                    .expect("Failed to fill QP table");
            }
            encoder.empty(input).expect("Failed to queue input frame");
            submitted += 1;
        }

        let message = match receiver.recv_timeout(Duration::from_secs(5)) {
            Ok(message) => message,
            Err(e) => {
                warn!("No news from the encoder: {}", e);
                break;
            }
        };
        match message {
            Message::InputDone(handle) => {
                // The end of stream request has no payload.
                if handle.payload() > 0 {
                    free_inputs.push(handle);
                }
            }
            Message::Encoded(handle, payload) => {
                if handle.flags().contains(BufferFlags::END_OF_FRAME) {
                    encoded += 1;
                }
                total_size = total_size.wrapping_add(payload);
                let elapsed = start_time.elapsed();
                let fps = encoded as f32 / elapsed.as_millis().max(1) as f32 * 1000.0;
                print!(
                    "\rEncoded frame {:#5}, bytes used:{:#6} total encoded size:{:#8} fps: {:#5.2}",
                    encoded, payload, total_size, fps,
                );
                io::stdout().flush().unwrap();

                if let Some(ref mut output) = output_file {
                    let data = handle
                        .mapping()
                        .and_then(|m| m.to_vec(handle.offset(), payload))
                        .expect("Failed to read encoded data");
                    output
                        .write_all(&data)
                        .expect("Error while writing output data");
                }
                encoder.fill(handle).expect("Failed to queue output buffer");
            }
            Message::EndOfStream => break,
            Message::Event(event) => warn!("Encoder event: {:?}", event),
        }
    }

    encoder.stop().unwrap();
    encoder.destroy().unwrap();

    // Insert new line since we were overwriting the same one
    println!();
    println!("{} frames submitted, {} encoded", submitted, encoded);
}
