use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Arg, Command};
use log::{info, warn};
use vcumod::decoder::DecModule;
use vcumod::device::dummy::DummyDevice;
use vcumod::memory::BufferHandle;
use vcumod::module::{Callbacks, Event, Module};
use vcumod::settings::{BufferSizes, DecSettings, MediaSettings, Property, PropertyValue};

enum Message {
    Detected(u32),
    Decoded(Arc<BufferHandle>, usize),
    EndOfStream,
    Event(Event),
}

struct Client(Mutex<mpsc::Sender<Message>>);

impl Client {
    fn send(&self, message: Message) {
        let _ = self.0.lock().unwrap().send(message);
    }
}

impl Callbacks for Client {
    fn emptied(&self, _handle: Arc<BufferHandle>) {}

    fn associate(&self, _input: Arc<BufferHandle>, _output: Arc<BufferHandle>) {}

    fn filled(&self, handle: Option<Arc<BufferHandle>>, offset: usize, payload: usize) {
        match handle {
            Some(handle) => {
                handle.set_offset(offset);
                self.send(Message::Decoded(handle, payload));
            }
            None => self.send(Message::EndOfStream),
        }
    }

    fn release(&self, _is_input: bool, _handle: Arc<BufferHandle>) {}

    fn event(&self, event: Event) {
        match event {
            Event::ResolutionDetected(info) => self.send(Message::Detected(info.min_buffers)),
            event => self.send(Message::Event(event)),
        }
    }
}

fn main() {
    env_logger::init();

    let matches = Command::new("Dummy stream decoder")
        .arg(
            Arg::new("stream")
                .required(true)
                .help("Path to a stream produced by the look-ahead encoder example"),
        )
        .arg(
            Arg::new("copy_on_display")
                .long("copy_on_display")
                .help("Decode into internal buffers, copied when displayed"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .takes_value(true)
                .help("Save the decoded frames to a file"),
        )
        .get_matches();

    let mut stream = Vec::new();
    File::open(matches.value_of("stream").unwrap())
        .and_then(|mut f| f.read_to_end(&mut stream))
        .expect("Failed to read stream");

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

    let mut settings = DecSettings::default();
    settings
        .set(PropertyValue::CopyOnDisplay(
            matches.is_present("copy_on_display"),
        ))
        .unwrap();
    let decoder = DecModule::new(Arc::new(DummyDevice::default()), settings)
        .expect("Failed to create decoder");
    let (sender, receiver) = mpsc::channel();
    decoder
        .set_callbacks(Arc::new(Client(Mutex::new(sender))))
        .unwrap();
    decoder.create().expect("Failed to create decoder");
    decoder.run().expect("Failed to start decoder");

    let input = BufferHandle::alloc(stream.len().max(1));
    input
        .mapping()
        .and_then(|m| m.write_at(0, &stream))
        .expect("Failed to write bitstream");
    input.set_payload(stream.len());
    decoder.empty(input).expect("Failed to queue bitstream");
    decoder
        .empty(BufferHandle::alloc(16))
        .expect("Failed to request end of stream");

    let start_time = Instant::now();
    let mut decoded = 0usize;
    while !lets_quit.load(Ordering::SeqCst) {
        let message = match receiver.recv_timeout(Duration::from_secs(5)) {
            Ok(message) => message,
            Err(e) => {
                warn!("No news from the decoder: {}", e);
                break;
            }
        };
        match message {
            Message::Detected(min_buffers) => {
                let size = match decoder.get(Property::BufferSizes) {
                    Ok(PropertyValue::BufferSizes(BufferSizes { output, .. })) => output,
                    _ => panic!("Decoder has no output size"),
                };
                if let Ok(PropertyValue::Resolution(resolution)) =
                    decoder.get(Property::Resolution)
                {
                    info!("Stream resolution: {}", resolution);
                }
                for _ in 0..min_buffers.max(1) + 1 {
                    decoder
                        .fill(BufferHandle::alloc(size))
                        .expect("Failed to queue output buffer");
                }
            }
            Message::Decoded(handle, payload) => {
                decoded += 1;
                let fps = decoded as f32 / start_time.elapsed().as_millis().max(1) as f32 * 1000.0;
                print!(
                    "\rDecoded frame {:#5}, bytes used:{:#8} fps: {:#5.2}",
                    decoded, payload, fps
                );
                io::stdout().flush().unwrap();

                if let Some(ref mut output) = output_file {
                    let data = handle
                        .mapping()
                        .and_then(|m| m.to_vec(handle.offset(), payload))
                        .expect("Failed to read decoded frame");
                    output
                        .write_all(&data)
                        .expect("Error while writing output data");
                }
                decoder.fill(handle).expect("Failed to queue output buffer");
            }
            Message::EndOfStream => break,
            Message::Event(event) => warn!("Decoder event: {:?}", event),
        }
    }

    decoder.stop().unwrap();
    decoder.destroy().unwrap();

    // Insert new line since we were overwriting the same one
    println!();
    println!("{} frames decoded", decoded);
}
