//! `PulseCountState` (spec.md §4.2): the one shipped `Reservable(kind)`.
//! Accepts `evaluate(batch_id, files)`, streams each bitstream to the board
//! over serial, and emits batched `results(batch_id, [(evaluation_id,
//! pulses)])` back to the owning client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use icefarm_common::event::{Event, EventKind};
use icefarm_common::model::PulseResult;
use serde_json::Value;

use super::flash::FlashState;
use super::test_state::TestState;
use super::{State, StateInput, Transition};
use crate::device::env::DeviceCtx;
use crate::device::registry::HandlerRegistry;
use crate::devicefile::{DeviceFileEvent, DeviceFileKind};
use crate::serial::SerialPort;

pub const KIND: &str = "pulsecount";
const CHUNK_SIZE: usize = 512;
const INTER_CHUNK_DELAY: Duration = Duration::from_micros(10);
const READY_LINE: &str = "Waiting for bitstream transfer";
const WATCHDOG_LINE: &str = "Watchdog timeout";
const FLUSH_THRESHOLD: usize = 4;

struct PendingEval {
    batch_id: String,
    evaluation_id: String,
    payload: Vec<u8>,
}

struct Shared {
    queue: Mutex<VecDeque<PendingEval>>,
    condvar: Condvar,
    exiting: Mutex<bool>,
    /// Evaluation ids still outstanding for this device. Open Question
    /// resolution (spec.md §9 "processResult"): an evaluation leaves this set
    /// once its result (or a non-requeued failure) is known, not merely once
    /// it is dequeued - a watchdog requeue leaves it pending.
    pending: Mutex<HashSet<String>>,
}

pub struct PulseCountState {
    kind: String,
    shared: std::sync::Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    port_open: bool,
}

impl PulseCountState {
    pub fn new(kind: String) -> Self {
        PulseCountState {
            kind,
            shared: std::sync::Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                exiting: Mutex::new(false),
                pending: Mutex::new(HashSet::new()),
            }),
            worker: None,
            port_open: false,
        }
    }

    fn spawn_worker(&mut self, ctx: &DeviceCtx, tty_path: String) {
        let shared = self.shared.clone();
        let env = ctx.env.clone();
        let serial = ctx.serial.clone();
        self.worker = Some(thread::spawn(move || run_worker(shared, env, serial, tty_path)));
        self.port_open = true;
    }
}

fn registry() -> &'static HandlerRegistry<PulseCountState> {
    static REGISTRY: OnceLock<HandlerRegistry<PulseCountState>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = HandlerRegistry::new();
        registry.register("evaluate", &["batch_id", "files"], |state, _ctx, fields| {
            state.enqueue_evaluate(&fields[0], &fields[1]);
            Transition::Stay
        });
        registry.register("unreserve", &[], |state, ctx, _fields| state.unreserve(ctx));
        registry
    })
}

impl PulseCountState {
    fn enqueue_evaluate(&self, batch_id: &Value, files: &Value) {
        let Some(batch_id) = batch_id.as_str() else {
            log::warn!(target: "icefarm_worker::device", "evaluate with non-string batch_id, dropping");
            return;
        };
        let files: HashMap<String, Vec<u8>> = match serde_json::from_value(files.clone()) {
            Ok(files) => files,
            Err(err) => {
                log::warn!(target: "icefarm_worker::device", "evaluate with malformed files map, dropping: {err}");
                return;
            }
        };

        let mut queue = self.shared.queue.lock().expect("pulsecount queue poisoned");
        let mut pending = self.shared.pending.lock().expect("pulsecount pending poisoned");
        for (evaluation_id, payload) in files {
            pending.insert(evaluation_id.clone());
            queue.push_back(PendingEval { batch_id: batch_id.to_string(), evaluation_id, payload });
        }
        self.shared.condvar.notify_all();
    }

    fn unreserve(&mut self, ctx: &DeviceCtx) -> Transition {
        self.shutdown_worker();
        Transition::Switch(Box::new(FlashState::new(
            ctx.env.firmware.default_image().clone(),
            Box::new(|_ctx: &DeviceCtx| Box::new(TestState::new()) as Box<dyn State>),
            Some(ctx.env.flash_timeout),
            Vec::new(),
        )))
    }

    fn shutdown_worker(&mut self) {
        *self.shared.exiting.lock().expect("pulsecount exiting poisoned") = true;
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.port_open = false;
    }

    /// Queue depth for this device, exposed for the manager's status line
    /// (supplemented per `SPEC_FULL.md`'s pending-set addition).
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().expect("pulsecount pending poisoned").len()
    }
}

fn run_worker(shared: std::sync::Arc<Shared>, env: std::sync::Arc<crate::device::env::DeviceEnv>, serial: String, tty_path: String) {
    let mut port = match env.open_serial(&tty_path) {
        Ok(port) => port,
        Err(err) => {
            log::error!(target: "icefarm_worker::device", "pulsecount worker for {serial} could not open {tty_path}: {err}");
            return;
        }
    };

    env.publish(Event::new(serial.clone(), EventKind::Initialized));

    let mut buffer: Vec<(String, Vec<PulseResult>)> = Vec::new();

    loop {
        let item = {
            let mut queue = shared.queue.lock().expect("pulsecount queue poisoned");
            loop {
                if *shared.exiting.lock().expect("pulsecount exiting poisoned") {
                    flush(&env, &serial, &mut buffer);
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                if queue.is_empty() && !buffer.is_empty() {
                    flush(&env, &serial, &mut buffer);
                }
                queue = shared.condvar.wait(queue).expect("pulsecount queue poisoned");
            }
        };

        match run_one_evaluation(port.as_mut(), &item.payload) {
            Ok(Some(pulses)) => {
                remove_pending(&shared, &item.evaluation_id);
                buffer.push((item.batch_id, vec![(item.evaluation_id, pulses)]));
            }
            Ok(None) => {
                log::warn!(target: "icefarm_worker::device", "watchdog timeout on {serial}, requeuing {}", item.evaluation_id);
                let mut queue = shared.queue.lock().expect("pulsecount queue poisoned");
                queue.push_back(item);
            }
            Err(err) => {
                log::error!(target: "icefarm_worker::device", "pulsecount transport error on {serial}: {err}");
                remove_pending(&shared, &item.evaluation_id);
            }
        }

        if buffer.len() >= FLUSH_THRESHOLD {
            flush(&env, &serial, &mut buffer);
        }
    }
}

fn remove_pending(shared: &Shared, evaluation_id: &str) {
    shared.pending.lock().expect("pulsecount pending poisoned").remove(evaluation_id);
}

fn run_one_evaluation(port: &mut dyn SerialPort, payload: &[u8]) -> std::io::Result<Option<u32>> {
    wait_for_line(port, READY_LINE, Duration::from_secs(5))?;

    for chunk in payload.chunks(CHUNK_SIZE) {
        port.write_all(chunk)?;
        std::thread::sleep(INTER_CHUNK_DELAY);
    }

    loop {
        match port.read_line(Duration::from_secs(10))? {
            None => return Ok(None),
            Some(line) => {
                if let Some(rest) = line.strip_prefix("pulses: ") {
                    return Ok(rest.trim().parse::<u32>().ok());
                }
                if line.trim() == WATCHDOG_LINE {
                    return Ok(None);
                }
            }
        }
    }
}

fn wait_for_line(port: &mut dyn SerialPort, expected: &str, timeout: Duration) -> std::io::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if let Some(line) = port.read_line(Duration::from_millis(200))? {
            if line.trim() == expected {
                return Ok(());
            }
        }
    }
    Ok(())
}

fn flush(env: &crate::device::env::DeviceEnv, serial: &str, buffer: &mut Vec<(String, Vec<PulseResult>)>) {
    if buffer.is_empty() {
        return;
    }
    let mut grouped: HashMap<String, Vec<PulseResult>> = HashMap::new();
    for (batch_id, results) in buffer.drain(..) {
        grouped.entry(batch_id).or_default().extend(results);
    }
    for (batch_id, results) in grouped {
        env.publish(Event::new(serial.to_string(), EventKind::Results { batch_id, results }));
    }
}

impl State for PulseCountState {
    fn name(&self) -> &'static str {
        "pulsecount"
    }

    fn exit(&mut self, _ctx: &DeviceCtx) {
        self.shutdown_worker();
    }

    fn on_event(&mut self, ctx: &DeviceCtx, input: StateInput) -> Transition {
        match input {
            StateInput::File(DeviceFileEvent::Added { file, .. }) if file.kind == DeviceFileKind::Tty && !self.port_open => {
                self.spawn_worker(ctx, file.path);
                Transition::Stay
            }
            StateInput::File(_) => Transition::Stay,
            StateInput::Request { event_kind, contents } => registry().dispatch(self, ctx, &event_kind, &contents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::env::DeviceEnv;
    use crate::device::firmware::FirmwareSet;
    use crate::devicefile::DeviceFile;
    use crate::serial::MockSerialPort;
    use crate::usbip::MockUsbIpController;
    use std::sync::{Arc, Mutex as StdMutex};

    fn test_ctx(published: Arc<StdMutex<Vec<Event>>>, responses: Vec<Option<String>>) -> DeviceCtx {
        let responses = StdMutex::new(Some(responses));
        let env = Arc::new(DeviceEnv::new(
            "w1".into(),
            icefarm_db::Db::open_in_memory().unwrap(),
            Arc::new(MockUsbIpController::new()),
            Arc::new(crate::device::bootloader_fs::MockBootloaderFs::valid()),
            Arc::new(FirmwareSet::new(crate::device::firmware::FirmwareImage { kind: "default".into(), bytes: vec![] })),
            Duration::from_secs(5),
            Arc::new(move |event: Event| published.lock().unwrap().push(event)),
            Arc::new(move |_path: &str| {
                let responses = responses.lock().unwrap().take().unwrap_or_default();
                Ok(Box::new(MockSerialPort::new(responses)) as Box<dyn SerialPort>)
            }),
        ));
        DeviceCtx::for_test("s1".into(), env)
    }

    #[test]
    fn evaluate_then_unreserve_runs_one_round_trip() {
        let published = Arc::new(StdMutex::new(Vec::new()));
        let responses = vec![
            Some(READY_LINE.to_string()),
            Some("pulses: 7".to_string()),
        ];
        let ctx = test_ctx(published.clone(), responses);
        let mut state = PulseCountState::new(KIND.to_string());

        state.on_event(&ctx, StateInput::File(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: None,
            model_id: None,
        }));

        let mut contents = HashMap::new();
        contents.insert("batch_id".to_string(), Value::String("b1".into()));
        let mut files = HashMap::new();
        files.insert("ev1".to_string(), vec![1u8, 2, 3]);
        contents.insert("files".to_string(), serde_json::to_value(files).unwrap());
        state.on_event(&ctx, StateInput::Request { event_kind: "evaluate".into(), contents });

        // give the worker thread a moment to process and flush on drain.
        std::thread::sleep(Duration::from_millis(100));

        state.on_event(&ctx, StateInput::Request { event_kind: "unreserve".into(), contents: HashMap::new() });

        let events = published.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e.contents, EventKind::Initialized)));
        assert!(events.iter().any(|e| matches!(&e.contents, EventKind::Results { batch_id, results } if batch_id == "b1" && results == &vec![("ev1".to_string(), 7)])));
    }
}
