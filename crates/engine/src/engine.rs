//! Media engine: the session table and call routing.
//!
//! Every host call is addressed by `(session_id, instance_id[, source_id])`.
//! The engine resolves the ids through its session table and forwards the
//! call to the owning [`MediaInstance`]. Sessions and instances come into
//! existence on `load`; every other call on an unknown id is `NotFound`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use common::{DisplayRect, EngineError, EngineResult};
use flinger_media::{
    AppendMode, AppendRequest, DispatchOutcome, Frame, HostAdapter, HostAdapterProvider,
    InstanceSettings, LoadError, LoadedMedia, MediaInstance, MediaLoader, MediaNetworkState,
    MediaReadyState, NullHostAdapter, PageEvent, PlaybackSnapshot, RawSampleDemuxer, SegmentDemuxer,
    TimeRange, TimeRanges,
};

use crate::config::EngineConfig;
use crate::session::Session;

/// The media engine.
pub struct Engine {
    config: EngineConfig,
    settings: Arc<InstanceSettings>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    provider: Arc<dyn HostAdapterProvider>,
    loader: Option<Arc<dyn MediaLoader>>,
    demuxer: Arc<dyn SegmentDemuxer>,
}

impl Engine {
    /// Create an engine reporting to the adapters of `provider`.
    pub fn new(config: EngineConfig, provider: Arc<dyn HostAdapterProvider>) -> Self {
        EngineBuilder::new().config(config).host_provider(provider).build()
    }

    /// Engine with default configuration and a host that drops every event.
    pub fn with_defaults() -> Self {
        EngineBuilder::new().build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Session table

    pub fn session(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("session '{}'", session_id)))
    }

    fn get_or_create_session(&self, session_id: &str) -> EngineResult<Arc<Session>> {
        if let Some(session) = self.sessions.read().get(session_id) {
            return Ok(Arc::clone(session));
        }

        // Host code; must not run under the session table lock.
        let adapter = self.provider.adapter_for(session_id);

        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(session_id) {
            return Ok(Arc::clone(session));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(EngineError::capacity(sessions.len() + 1, self.config.max_sessions));
        }

        let session = Arc::new(Session::new(
            session_id,
            adapter,
            Arc::clone(&self.settings),
            self.config.max_instances_per_session,
        ));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        info!(session = session_id, "Created session");
        Ok(session)
    }

    /// Session ids, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn instance(&self, session_id: &str, instance_id: &str) -> EngineResult<Arc<MediaInstance>> {
        self.session(session_id)?.instance(instance_id)
    }

    /// Tear down a session and all of its instances.
    pub fn close_session(&self, session_id: &str) -> EngineResult<()> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| EngineError::not_found(format!("session '{}'", session_id)))?;
        session.close();
        info!(session = session_id, "Closed session");
        Ok(())
    }

    /// Tear down one instance. The session stays even when left empty.
    pub fn remove_instance(&self, session_id: &str, instance_id: &str) -> EngineResult<()> {
        self.session(session_id)?.remove_instance(instance_id)
    }

    // Control surface

    /// Load `url`, creating the session and instance on first reference.
    /// The instance becomes the session's active render target.
    pub fn load(&self, session_id: &str, instance_id: &str, url: &str) -> EngineResult<()> {
        let session = self.get_or_create_session(session_id)?;
        let instance = session.get_or_create_instance(instance_id)?;
        session.set_active_instance(instance_id)?;
        instance.load(url, self.loader.clone())?;
        Ok(())
    }

    /// Cancel an in-flight load. Returns whether one was cancelled.
    pub fn cancel_load(&self, session_id: &str, instance_id: &str) -> EngineResult<bool> {
        Ok(self.instance(session_id, instance_id)?.cancel_load())
    }

    pub fn pause(&self, session_id: &str, instance_id: &str) -> EngineResult<()> {
        self.instance(session_id, instance_id)?.pause()
    }

    pub fn play(&self, session_id: &str, instance_id: &str) -> EngineResult<()> {
        self.instance(session_id, instance_id)?.play()
    }

    pub fn seek(&self, session_id: &str, instance_id: &str, time: f64) -> EngineResult<()> {
        self.instance(session_id, instance_id)?.seek(time)
    }

    pub fn get_paused(&self, session_id: &str, instance_id: &str) -> EngineResult<bool> {
        Ok(self.instance(session_id, instance_id)?.paused())
    }

    pub fn get_seeking(&self, session_id: &str, instance_id: &str) -> EngineResult<bool> {
        Ok(self.instance(session_id, instance_id)?.seeking())
    }

    pub fn get_duration(&self, session_id: &str, instance_id: &str) -> EngineResult<f64> {
        Ok(self.instance(session_id, instance_id)?.duration())
    }

    pub fn get_current_time(&self, session_id: &str, instance_id: &str) -> EngineResult<f64> {
        Ok(self.instance(session_id, instance_id)?.current_time())
    }

    pub fn get_network_state(
        &self,
        session_id: &str,
        instance_id: &str,
    ) -> EngineResult<MediaNetworkState> {
        Ok(self.instance(session_id, instance_id)?.network_state())
    }

    pub fn get_ready_state(&self, session_id: &str, instance_id: &str) -> EngineResult<MediaReadyState> {
        Ok(self.instance(session_id, instance_id)?.ready_state())
    }

    pub fn get_max_time_seekable(&self, session_id: &str, instance_id: &str) -> EngineResult<f64> {
        Ok(self.instance(session_id, instance_id)?.max_time_seekable())
    }

    pub fn get_visible(&self, session_id: &str, instance_id: &str) -> EngineResult<bool> {
        Ok(self.instance(session_id, instance_id)?.visible())
    }

    pub fn get_buffered(&self, session_id: &str, instance_id: &str) -> EngineResult<TimeRanges> {
        Ok(self.instance(session_id, instance_id)?.buffered())
    }

    pub fn snapshot(&self, session_id: &str, instance_id: &str) -> EngineResult<PlaybackSnapshot> {
        Ok(self.instance(session_id, instance_id)?.snapshot())
    }

    /// Set display geometry. Negative host values are clamped.
    pub fn set_rect(
        &self,
        session_id: &str,
        instance_id: &str,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> EngineResult<()> {
        let instance = self.instance(session_id, instance_id)?;
        instance.set_rect(DisplayRect::from_host(x, y, width, height));
        Ok(())
    }

    pub fn set_visible(&self, session_id: &str, instance_id: &str, visible: bool) -> EngineResult<()> {
        self.instance(session_id, instance_id)?.set_visible(visible);
        Ok(())
    }

    // MSE surface

    pub fn add_source_buffer(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        mime_type: &str,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .add_source_buffer(source_id, mime_type)
    }

    pub fn remove_source_buffer(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .remove_source_buffer(source_id)
    }

    pub fn abort_source_buffer(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .abort_source_buffer(source_id)
    }

    /// Append a segment and return the source buffer's ranges.
    pub fn append_buffer(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        request: AppendRequest<'_>,
    ) -> EngineResult<Vec<TimeRange>> {
        let instance = self.instance(session_id, instance_id)?;
        let ranges = instance.append_buffer(source_id, self.demuxer.as_ref(), request)?;
        debug!(
            session = session_id,
            instance = instance_id,
            source = source_id,
            ranges = ranges.len(),
            "Append complete"
        );
        Ok(ranges)
    }

    pub fn set_append_mode(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        mode: AppendMode,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .set_append_mode(source_id, mode)
    }

    pub fn set_append_timestamp_offset(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        offset: f64,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .set_append_timestamp_offset(source_id, offset)
    }

    pub fn remove_buffer_range(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        start: f64,
        end: f64,
    ) -> EngineResult<Vec<TimeRange>> {
        self.instance(session_id, instance_id)?
            .remove_buffer_range(source_id, start, end)
    }

    pub fn change_source_buffer_type(
        &self,
        session_id: &str,
        instance_id: &str,
        source_id: &str,
        mime_type: &str,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .change_source_buffer_type(source_id, mime_type)
    }

    // Decoder side

    /// Report the outcome of the current load of an instance.
    pub fn complete_load(
        &self,
        session_id: &str,
        instance_id: &str,
        result: Result<LoadedMedia, LoadError>,
    ) -> EngineResult<bool> {
        Ok(self.instance(session_id, instance_id)?.finish_load(result))
    }

    pub fn complete_seek(&self, session_id: &str, instance_id: &str) -> EngineResult<bool> {
        self.instance(session_id, instance_id)?.complete_seek()
    }

    pub fn set_metadata(
        &self,
        session_id: &str,
        instance_id: &str,
        duration: f64,
        video_width: u32,
        video_height: u32,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .set_metadata(duration, video_width, video_height)
    }

    pub fn set_ready_state(
        &self,
        session_id: &str,
        instance_id: &str,
        state: MediaReadyState,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?.set_ready_state(state);
        Ok(())
    }

    pub fn report_buffered(
        &self,
        session_id: &str,
        instance_id: &str,
        start: f64,
        end: f64,
    ) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .report_buffered(start, end)
    }

    pub fn update_current_time(&self, session_id: &str, instance_id: &str, time: f64) -> EngineResult<()> {
        self.instance(session_id, instance_id)?
            .update_current_time(time)
    }

    // Session messages

    /// Relay an application message to the session's host and return its
    /// reply.
    pub fn send_message(&self, session_id: &str, message: &str) -> EngineResult<String> {
        let adapter = self.session(session_id)?.adapter();
        debug!(session = session_id, bytes = message.len(), "Relaying message");
        adapter.on_message(session_id, message)
    }

    /// Relay a page lifecycle event to the session's host.
    pub fn page_event(&self, session_id: &str, event: &PageEvent) -> EngineResult<()> {
        let adapter = self.session(session_id)?.adapter();
        debug!(session = session_id, event = event.name(), "Relaying page event");
        adapter.on_page_event(session_id, event)
    }

    // Frames

    /// Deliver a frame to the session's active instance.
    pub fn dispatch_frame(&self, session_id: &str, frame: &Frame) -> EngineResult<DispatchOutcome> {
        self.session(session_id)?.active_instance()?.dispatch(frame)
    }

    /// Deliver a frame for a specific instance.
    pub fn dispatch_instance_frame(
        &self,
        session_id: &str,
        instance_id: &str,
        frame: &Frame,
    ) -> EngineResult<DispatchOutcome> {
        self.instance(session_id, instance_id)?.dispatch(frame)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sessions", &self.session_ids())
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}

/// Engine builder.
pub struct EngineBuilder {
    config: EngineConfig,
    provider: Arc<dyn HostAdapterProvider>,
    loader: Option<Arc<dyn MediaLoader>>,
    demuxer: Arc<dyn SegmentDemuxer>,
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        let null: Arc<dyn HostAdapter> = Arc::new(NullHostAdapter);
        Self {
            config: EngineConfig::default(),
            provider: Arc::new(move |_: &str| Arc::clone(&null)),
            loader: None,
            demuxer: Arc::new(RawSampleDemuxer),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the source of per-session host adapters.
    pub fn host_provider(mut self, provider: Arc<dyn HostAdapterProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Use one adapter for every session.
    pub fn host_adapter(self, adapter: Arc<dyn HostAdapter>) -> Self {
        self.host_provider(Arc::new(move |_: &str| Arc::clone(&adapter)))
    }

    /// Fetch `load` targets with `loader`.
    pub fn loader(mut self, loader: Arc<dyn MediaLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn demuxer(mut self, demuxer: Arc<dyn SegmentDemuxer>) -> Self {
        self.demuxer = demuxer;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        Engine {
            settings: Arc::new(self.config.instance_settings()),
            config: self.config,
            sessions: RwLock::new(HashMap::new()),
            provider: self.provider,
            loader: self.loader,
            demuxer: self.demuxer,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
