//! Decode workers.
//!
//! One worker per stream pulls units out of a [`StreamDecoder`] and pushes
//! them into the stream's [`BoundedQueue`], blocking while the queue is
//! full. Workers never touch the master clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::decoder::{is_fatal, StreamDecoder};
use crate::error::{ErrorCategory, Result};
use crate::events::EventSender;
use crate::frame_queue::BoundedQueue;
use crate::media::MediaUnit;
use crate::seek::SeekController;
use crate::session::{spawn_guarded, Transport};

/// How long an idle worker waits for a command before re-checking its flags.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Commands sent to a decode worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeCommand {
    /// Start or resume decoding
    Play,
    /// Stop pulling packets; the queue keeps what it has
    Pause,
    /// Reposition to `target`; units from here on carry `generation`
    Seek { generation: u64, target: Duration },
    /// Exit the worker
    Stop,
}

/// A decode thread feeding one stream's queue.
pub struct DecodeWorker {
    handle: Option<JoinHandle<()>>,
    command_tx: Sender<DecodeCommand>,
    stop_flag: Arc<AtomicBool>,
    name: &'static str,
}

impl DecodeWorker {
    /// Starts a worker in the paused state.
    ///
    /// With `preview` set the worker decodes one unit even while paused,
    /// initially and after every seek, so the UI has a frame to show.
    pub fn spawn<D>(
        name: &'static str,
        decoder: D,
        queue: Arc<BoundedQueue<D::Unit>>,
        transport: &Transport,
        seek: Arc<SeekController>,
        events: EventSender,
        preview: bool,
    ) -> Result<Self>
    where
        D: StreamDecoder + 'static,
    {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker = DecodeLoop {
            decoder,
            queue,
            seek: Arc::clone(&seek),
            events: events.clone(),
            playing: false,
            generation: transport.generation(),
            discard_before: Duration::ZERO,
            preview,
            preview_pending: preview,
            finished: false,
            failed: false,
        };
        let stop = Arc::clone(&stop_flag);

        let handle = spawn_guarded(
            name,
            ErrorCategory::DecodeFailure,
            events,
            move || seek.worker_lost(),
            move || worker.run(command_rx, stop),
        )?;
        transport.register(command_tx.clone());

        Ok(Self {
            handle: Some(handle),
            command_tx,
            stop_flag,
            name,
        })
    }

    /// Asks the worker to exit. The queue must be stopped separately if the
    /// worker may be blocked pushing into it.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.command_tx.send(DecodeCommand::Stop);
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("{} worker exited abnormally", self.name);
            }
        }
    }
}

struct DecodeLoop<D: StreamDecoder> {
    decoder: D,
    queue: Arc<BoundedQueue<D::Unit>>,
    seek: Arc<SeekController>,
    events: EventSender,
    playing: bool,
    generation: u64,
    /// Units presenting before this point are trimmed or dropped after a seek
    discard_before: Duration,
    preview: bool,
    preview_pending: bool,
    /// End of stream reached in this generation
    finished: bool,
    /// The decoder reported a fatal error; only a seek can restart it
    failed: bool,
}

impl<D: StreamDecoder> DecodeLoop<D> {
    fn run(mut self, command_rx: Receiver<DecodeCommand>, stop_flag: Arc<AtomicBool>) {
        let label = self.decoder.label();
        tracing::debug!("{} decode loop started", label);

        loop {
            if stop_flag.load(Ordering::Acquire) {
                break;
            }

            // Process commands (non-blocking)
            while let Ok(cmd) = command_rx.try_recv() {
                if !self.apply(cmd) {
                    return;
                }
            }

            if self.is_idle() {
                match command_rx.recv_timeout(IDLE_POLL) {
                    Ok(cmd) => {
                        if !self.apply(cmd) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            self.decode_one();
        }

        tracing::debug!("{} decode loop exited", label);
    }

    fn is_idle(&self) -> bool {
        self.finished || self.failed || (!self.playing && !self.preview_pending)
    }

    /// Applies one command. Returns false when the loop should exit.
    fn apply(&mut self, cmd: DecodeCommand) -> bool {
        match cmd {
            DecodeCommand::Stop => return false,
            DecodeCommand::Play => self.playing = true,
            DecodeCommand::Pause => self.playing = false,
            DecodeCommand::Seek { generation, target } => self.reposition(generation, target),
        }
        true
    }

    fn reposition(&mut self, generation: u64, target: Duration) {
        let label = self.decoder.label();
        self.generation = generation;
        self.discard_before = target;
        self.preview_pending = self.preview;
        self.finished = false;

        if self.failed {
            // Nothing more will come out of this stream
            self.queue.push_end_of_stream(generation);
        } else if let Err(err) = self.decoder.seek(target) {
            tracing::error!("{} seek to {:?} failed: {}", label, target, err);
            self.events.error(
                ErrorCategory::DecodeFailure,
                format!("{label} seek failed: {err}"),
            );
        } else {
            tracing::debug!(
                "{} repositioned to {:?} (generation {})",
                label,
                target,
                generation
            );
        }
        self.seek.acknowledge(generation);
    }

    fn decode_one(&mut self) {
        let label = self.decoder.label();
        match self.decoder.decode_next() {
            Ok(Some(mut unit)) => {
                if !unit.trim_front(self.discard_before) {
                    tracing::trace!("{} unit at {:?} precedes seek target", label, unit.pts());
                    return;
                }
                unit.set_generation(self.generation);
                let pts = unit.pts();
                if self.queue.push(unit) {
                    tracing::trace!("{} queued unit at {:?}", label, pts);
                    self.preview_pending = false;
                } else {
                    tracing::debug!("{} unit at {:?} rejected by queue (flushed)", label, pts);
                }
            }
            Ok(None) if self.decoder.is_eof() => {
                tracing::debug!("{} end of stream (generation {})", label, self.generation);
                self.queue.push_end_of_stream(self.generation);
                self.finished = true;
            }
            Ok(None) => {
                // Backend is waiting on more input
                thread::sleep(Duration::from_millis(2));
            }
            Err(err) if is_fatal(&err) => {
                tracing::error!("{} decode failed: {}", label, err);
                self.events.error(
                    ErrorCategory::DecodeFailure,
                    format!("{label} stream failed: {err}"),
                );
                self.queue.push_end_of_stream(self.generation);
                self.failed = true;
            }
            Err(err) => {
                tracing::warn!("Skipping corrupt {} packet: {}", label, err);
            }
        }
    }
}
