use crate::pipeline::PipelineExecutionContext;
use crate::watermark::MultiOriginWatermarkProcessor;
use anyhow::{bail, Context};
use bincode::{Decode, Encode};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sluice_state::memory_controller::MemoryController;
use sluice_state::slice_cache::SliceCache;
use sluice_state::{
    DefaultTimeBasedSliceStore, Slice, SliceAssigner, SliceStoreError, SpillOptions,
    WindowSlicesStore, WindowsToSlices,
};
use sluice_types::config::{Config, SliceCacheType, SliceStoreType};
use sluice_types::{
    BufferMetaData, BufferProvider, FileLayout, OriginId, QueryTerminationType, SequenceNumber,
    Timestamp, WindowType,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    Active,
    Triggering,
    Idle,
    Destroyed,
}

impl HandlerState {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerState::Created => "created",
            HandlerState::Active => "active",
            HandlerState::Triggering => "triggering",
            HandlerState::Idle => "idle",
            HandlerState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SliceStoreOptions {
    Default,
    FileBacked {
        working_dir: PathBuf,
        file_buffer_size: usize,
        file_layout: FileLayout,
        spill: SpillOptions,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceCacheOptions {
    pub cache_type: SliceCacheType,
    pub number_of_entries: u64,
    pub size_of_entry: usize,
}

impl Default for SliceCacheOptions {
    fn default() -> Self {
        Self {
            cache_type: SliceCacheType::None,
            number_of_entries: 0,
            size_of_entry: sluice_state::slice_cache::MIN_ENTRY_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOptions {
    pub window: WindowType,
    pub input_origins: Vec<OriginId>,
    pub output_origin: OriginId,
    pub slice_store: SliceStoreOptions,
    pub slice_cache: SliceCacheOptions,
}

impl HandlerOptions {
    pub fn new(window: WindowType, input_origins: Vec<OriginId>, output_origin: OriginId) -> Self {
        Self {
            window,
            input_origins,
            output_origin,
            slice_store: SliceStoreOptions::Default,
            slice_cache: SliceCacheOptions::default(),
        }
    }

    /// Takes the slice store and cache settings from the loaded configuration.
    pub fn from_config(
        config: &Config,
        window: WindowType,
        input_origins: Vec<OriginId>,
        output_origin: OriginId,
    ) -> Self {
        let slice_store = match config.slice_store.r#type {
            SliceStoreType::Default => SliceStoreOptions::Default,
            SliceStoreType::FileBacked => SliceStoreOptions::FileBacked {
                working_dir: config.spill.working_dir.clone(),
                file_buffer_size: config.spill.file_buffer_size,
                file_layout: config.spill.file_layout,
                spill: SpillOptions {
                    min_write_state_size: config.spill.min_write_state_size,
                    watermark_lookahead: config.spill.watermark_lookahead,
                },
            },
        };

        Self {
            slice_store,
            slice_cache: SliceCacheOptions {
                cache_type: config.slice_cache.r#type,
                number_of_entries: config.slice_cache.number_of_entries,
                ..Default::default()
            },
            ..Self::new(window, input_origins, output_origin)
        }
    }

    pub fn with_slice_store(mut self, slice_store: SliceStoreOptions) -> Self {
        self.slice_store = slice_store;
        self
    }

    pub fn with_slice_cache(mut self, cache_type: SliceCacheType, number_of_entries: u64) -> Self {
        self.slice_cache.cache_type = cache_type;
        self.slice_cache.number_of_entries = number_of_entries;
        self
    }

    pub(crate) fn default_store<S: Slice>(
        &self,
        assigner: SliceAssigner,
    ) -> Box<dyn WindowSlicesStore<S>> {
        Box::new(DefaultTimeBasedSliceStore::new(assigner))
    }

    pub(crate) fn memory_controller(&self) -> sluice_state::Result<Option<MemoryController>> {
        match &self.slice_store {
            SliceStoreOptions::Default => Ok(None),
            SliceStoreOptions::FileBacked {
                working_dir,
                file_buffer_size,
                file_layout,
                ..
            } => Ok(Some(MemoryController::new(
                working_dir,
                self.output_origin,
                *file_buffer_size,
                *file_layout,
            )?)),
        }
    }
}

/// What a handler learns when its pipeline starts.
#[derive(Clone)]
pub struct HandlerRuntime {
    pub number_of_threads: u64,
    pub provider: Arc<dyn BufferProvider>,
}

struct Started<S> {
    runtime: HandlerRuntime,
    store: Box<dyn WindowSlicesStore<S>>,
}

#[derive(Encode, Decode)]
struct StateFileHeader {
    number_of_slices: u64,
    next_sequence_number: u64,
    last_trigger_watermark: u64,
}

#[derive(Encode, Decode)]
struct SliceFileHeader {
    start: u64,
    end: u64,
}

/// State shared by all window based operator handlers.
pub struct WindowHandlerCore<S> {
    options: HandlerOptions,
    assigner: SliceAssigner,
    build_watermarks: MultiOriginWatermarkProcessor,
    probe_watermarks: MultiOriginWatermarkProcessor,
    sequence_number: AtomicU64,
    state: Mutex<HandlerState>,
    trigger_lock: Mutex<()>,
    started: OnceCell<Started<S>>,
    slice_cache: OnceCell<SliceCache<S>>,
}

impl<S: Slice> WindowHandlerCore<S> {
    pub fn new(options: HandlerOptions) -> sluice_state::Result<Self> {
        let assigner = SliceAssigner::for_window(options.window)?;
        Ok(Self {
            build_watermarks: MultiOriginWatermarkProcessor::new(&options.input_origins),
            probe_watermarks: MultiOriginWatermarkProcessor::new(&[options.output_origin]),
            options,
            assigner,
            sequence_number: AtomicU64::new(SequenceNumber::INITIAL.0),
            state: Mutex::new(HandlerState::Created),
            trigger_lock: Mutex::new(()),
            started: OnceCell::new(),
            slice_cache: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub fn slice_assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    pub fn output_origin(&self) -> OriginId {
        self.options.output_origin
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    fn expect_state(&self, expected: &[HandlerState]) -> sluice_state::Result<HandlerState> {
        let state = self.state();
        if !expected.contains(&state) {
            return Err(SliceStoreError::HandlerState {
                expected: expected.first().map(|s| s.name()).unwrap_or("?"),
                actual: state.name(),
            });
        }
        Ok(state)
    }

    fn set_state(&self, state: HandlerState) {
        let mut current = self.state.lock();
        debug!("handler state {} -> {}", current.name(), state.name());
        *current = state;
    }

    pub fn runtime(&self) -> sluice_state::Result<&HandlerRuntime> {
        self.started
            .get()
            .map(|s| &s.runtime)
            .ok_or(SliceStoreError::HandlerState {
                expected: HandlerState::Active.name(),
                actual: HandlerState::Created.name(),
            })
    }

    pub fn store(&self) -> sluice_state::Result<&dyn WindowSlicesStore<S>> {
        self.started
            .get()
            .map(|s| s.store.as_ref())
            .ok_or(SliceStoreError::HandlerState {
                expected: HandlerState::Active.name(),
                actual: self.state().name(),
            })
    }

    pub fn slice_cache(&self) -> Option<&SliceCache<S>> {
        self.slice_cache.get()
    }

    /// Creates the slice cache regions exactly once, no matter how many callers race here.
    pub fn allocate_slice_cache_entries(
        &self,
        size_of_entry: usize,
        number_of_entries: u64,
        number_of_threads: u64,
        provider: &dyn BufferProvider,
    ) -> sluice_state::Result<()> {
        self.slice_cache.get_or_try_init(|| {
            debug!(
                "allocating {} slice cache entries of {} bytes for {} threads",
                number_of_entries, size_of_entry, number_of_threads
            );
            SliceCache::allocate(
                self.options.slice_cache.cache_type,
                size_of_entry,
                number_of_entries as usize,
                number_of_threads,
                provider,
            )
        })?;
        Ok(())
    }

    pub fn next_sequence_number(&self) -> SequenceNumber {
        SequenceNumber(self.sequence_number.fetch_add(1, Ordering::AcqRel))
    }
}

/// Drives watermark based triggering of the windows of one operator instance.
pub trait WindowBasedOperatorHandler: Send + Sync {
    type Slice: Slice;

    fn core(&self) -> &WindowHandlerCore<Self::Slice>;

    /// Builds the empty slice for `[start, end)`.
    fn create_new_slice(
        &self,
        start: Timestamp,
        end: Timestamp,
        runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Arc<Self::Slice>>;

    fn create_store(
        &self,
        runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Box<dyn WindowSlicesStore<Self::Slice>>>;

    /// Emits the work for every given window.
    fn trigger_slices(
        &self,
        windows: WindowsToSlices<Self::Slice>,
        ctx: &dyn PipelineExecutionContext,
    ) -> anyhow::Result<()>;

    fn get_create_new_slices_function(
        &self,
    ) -> Box<dyn Fn(Timestamp, Timestamp) -> sluice_state::Result<Arc<Self::Slice>> + Sync + '_>
    {
        Box::new(move |start, end| {
            let runtime = self.core().runtime()?;
            self.create_new_slice(start, end, runtime)
        })
    }

    fn start(&self, ctx: &dyn PipelineExecutionContext) -> anyhow::Result<()> {
        let core = self.core();
        core.expect_state(&[HandlerState::Created])?;

        let runtime = HandlerRuntime {
            number_of_threads: ctx.number_of_worker_threads(),
            provider: ctx.buffer_provider(),
        };
        let store = self.create_store(&runtime)?;

        let cache = core.options().slice_cache;
        if cache.cache_type != SliceCacheType::None {
            core.allocate_slice_cache_entries(
                cache.size_of_entry,
                cache.number_of_entries,
                runtime.number_of_threads,
                runtime.provider.as_ref(),
            )
            .context("allocating slice cache")?;
        }

        if core.started.set(Started { runtime, store }).is_err() {
            bail!("handler was started twice");
        }
        core.set_state(HandlerState::Active);
        info!(
            "started window handler for {:?} with {} worker threads",
            core.options().window,
            ctx.number_of_worker_threads()
        );
        Ok(())
    }

    /// Advances the build-side watermark with `meta` and triggers every window that became
    /// complete.
    fn check_and_trigger_windows(
        &self,
        meta: BufferMetaData,
        ctx: &dyn PipelineExecutionContext,
    ) -> anyhow::Result<()> {
        let core = self.core();
        let watermark = core.build_watermarks.update_watermark(
            meta.watermark,
            meta.sequence_number,
            meta.origin_id,
        )?;

        let _guard = core.trigger_lock.lock();
        core.expect_state(&[HandlerState::Active])?;
        let windows = core
            .store()?
            .get_slices_and_windows_ready_for_trigger(watermark)?;
        if windows.is_empty() {
            return Ok(());
        }

        core.set_state(HandlerState::Triggering);
        debug!("triggering {} windows at watermark {}", windows.len(), watermark);
        let result = self.trigger_slices(windows, ctx);
        core.set_state(HandlerState::Active);
        result
    }

    /// Triggers every window that has not been triggered yet, e.g. when the query ends.
    fn trigger_all_slices(&self, ctx: &dyn PipelineExecutionContext) -> anyhow::Result<()> {
        let core = self.core();
        let _guard = core.trigger_lock.lock();
        let windows = core.store()?.get_all_non_triggered_slices()?;
        if windows.is_empty() {
            return Ok(());
        }
        info!("triggering all {} remaining windows", windows.len());
        self.trigger_slices(windows, ctx)
    }

    /// Called by the probe once a window has been processed completely. `meta` carries the
    /// window end as watermark and the window's sequence number.
    fn garbage_collect_slices_and_windows(&self, meta: BufferMetaData) -> anyhow::Result<()> {
        let core = self.core();
        let watermark = core.probe_watermarks.update_watermark(
            meta.watermark,
            meta.sequence_number,
            meta.origin_id,
        )?;
        match core.store() {
            Ok(store) => {
                store.garbage_collect_slices_and_windows(watermark)?;
            }
            Err(_) => debug!("skipping garbage collection; handler is not running"),
        }
        Ok(())
    }

    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &dyn PipelineExecutionContext,
    ) -> anyhow::Result<()> {
        let core = self.core();
        let state = core.state();
        if state == HandlerState::Destroyed {
            return Ok(());
        }

        if termination == QueryTerminationType::Graceful && state == HandlerState::Active {
            self.trigger_all_slices(ctx)?;
        }

        if let Ok(store) = core.store() {
            store.delete_state()?;
        }
        core.set_state(HandlerState::Destroyed);
        info!("stopped window handler ({:?})", termination);
        Ok(())
    }

    /// Writes every live slice plus the handler counters to `path`. The handler is idle
    /// afterwards and only accepts `stop`.
    fn write_state_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let core = self.core();
        let _guard = core.trigger_lock.lock();
        core.expect_state(&[HandlerState::Active])?;
        let store = core.store()?;

        let file = File::create(path)
            .map_err(|e| SliceStoreError::io(path, e))
            .context("creating state file")?;
        let mut out = BufWriter::new(file);

        store.load_all_slices()?;
        let slices = store.get_all_slices();
        let header = StateFileHeader {
            number_of_slices: slices.len() as u64,
            next_sequence_number: core.sequence_number.load(Ordering::Acquire),
            last_trigger_watermark: store.last_trigger_watermark().0,
        };
        let config = bincode::config::standard();
        bincode::encode_into_std_write(header, &mut out, config)?;
        for slice in &slices {
            let slice_header = SliceFileHeader {
                start: slice.slice_start().0,
                end: slice.slice_end().0,
            };
            bincode::encode_into_std_write(slice_header, &mut out, config)?;
            slice.serialize(&mut out)?;
        }
        out.flush().map_err(|e| SliceStoreError::io(path, e))?;

        core.set_state(HandlerState::Idle);
        info!("wrote {} slices to {}", slices.len(), path.display());
        Ok(())
    }

    /// Loads the slices written by [`WindowBasedOperatorHandler::write_state_to_file`] into
    /// this started handler. Windows that were triggered before the state was written are not
    /// triggered again.
    fn restore_state_from_file(&self, path: &Path) -> anyhow::Result<()> {
        let core = self.core();
        let _guard = core.trigger_lock.lock();
        core.expect_state(&[HandlerState::Active])?;
        let runtime = core.runtime()?;
        let store = core.store()?;
        if store.get_number_of_slices() > 0 {
            bail!("cannot restore state into a handler that already holds slices");
        }

        let file = File::open(path)
            .map_err(|e| SliceStoreError::io(path, e))
            .context("opening state file")?;
        let mut input = BufReader::new(file);
        let config = bincode::config::standard();

        let header: StateFileHeader = bincode::decode_from_std_read(&mut input, config)?;
        for _ in 0..header.number_of_slices {
            let slice_header: SliceFileHeader = bincode::decode_from_std_read(&mut input, config)?;
            let slice = self.create_new_slice(
                Timestamp(slice_header.start),
                Timestamp(slice_header.end),
                runtime,
            )?;
            slice.deserialize(runtime.provider.as_ref(), &mut input)?;
            store.insert_slice(slice)?;
        }

        if header.last_trigger_watermark > 0 {
            let already_triggered =
                store.get_slices_and_windows_ready_for_trigger(Timestamp(header.last_trigger_watermark))?;
            debug!(
                "{} restored windows were triggered before the state was written",
                already_triggered.len()
            );
        }
        core.sequence_number
            .fetch_max(header.next_sequence_number, Ordering::AcqRel);
        core.probe_watermarks.resume_origin(
            core.output_origin(),
            SequenceNumber(header.next_sequence_number),
        )?;

        if store.get_number_of_slices() as u64 != header.number_of_slices {
            warn!(
                "restored {} of {} slices",
                store.get_number_of_slices(),
                header.number_of_slices
            );
        }
        info!(
            "restored {} slices from {}",
            header.number_of_slices,
            path.display()
        );
        Ok(())
    }
}
