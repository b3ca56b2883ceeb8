//! Typed control requests.
//!
//! A [`ControlRequest`] names the service to run (`"service": "appendBuffer"`)
//! and the ids it addresses. [`Engine::handle`] executes it and always
//! produces a [`ControlResponse`]; failures are reported in the response,
//! never raised.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use common::{EngineError, EngineResult};
use flinger_media::{AppendMode, AppendRequest, AppendWindow, PageEvent, TimeRanges};

use crate::engine::Engine;

/// One host call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    /// Echoed in the response.
    #[serde(default)]
    pub request_id: String,
    pub session_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(flatten)]
    pub call: ControlCall,
}

/// The service a request runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlCall {
    Load {
        url: String,
    },
    CancelLoad,
    Pause,
    Play,
    Seek {
        time: f64,
    },
    GetPaused,
    GetSeeking,
    GetDuration,
    GetCurrentTime,
    GetNetworkState,
    GetReadyState,
    GetMaxTimeSeekable,
    GetBuffered,
    GetVisible,
    SetRect {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    SetVisible {
        visible: bool,
    },
    AddSourceBuffer {
        source_id: String,
        mime_type: String,
    },
    RemoveSourceBuffer {
        source_id: String,
    },
    AbortSourceBuffer {
        source_id: String,
    },
    AppendBuffer {
        source_id: String,
        /// Defaults to 0.
        append_window_start: Option<f64>,
        /// Defaults to +inf.
        append_window_end: Option<f64>,
        #[serde(default)]
        buffer_id: u64,
        #[serde(default)]
        offset: usize,
        /// Defaults to the rest of the payload.
        length: Option<usize>,
        payload: Vec<u8>,
    },
    SetAppendMode {
        source_id: String,
        mode: AppendMode,
    },
    SetAppendTimestampOffset {
        source_id: String,
        offset: f64,
    },
    RemoveBufferRange {
        source_id: String,
        start: f64,
        end: f64,
    },
    ChangeSourceBufferType {
        source_id: String,
        mime_type: String,
    },
    RemoveInstance,
    CloseSession,
    SendMessage {
        message: String,
    },
    OnPageLoad,
    OnAddressBarChanged {
        url: String,
    },
    OnTitleChanged {
        title: String,
    },
    OnPageClose,
}

impl ControlCall {
    /// Service name as it appears on the wire.
    pub fn service(&self) -> &'static str {
        match self {
            ControlCall::Load { .. } => "load",
            ControlCall::CancelLoad => "cancelLoad",
            ControlCall::Pause => "pause",
            ControlCall::Play => "play",
            ControlCall::Seek { .. } => "seek",
            ControlCall::GetPaused => "getPaused",
            ControlCall::GetSeeking => "getSeeking",
            ControlCall::GetDuration => "getDuration",
            ControlCall::GetCurrentTime => "getCurrentTime",
            ControlCall::GetNetworkState => "getNetworkState",
            ControlCall::GetReadyState => "getReadyState",
            ControlCall::GetMaxTimeSeekable => "getMaxTimeSeekable",
            ControlCall::GetBuffered => "getBuffered",
            ControlCall::GetVisible => "getVisible",
            ControlCall::SetRect { .. } => "setRect",
            ControlCall::SetVisible { .. } => "setVisible",
            ControlCall::AddSourceBuffer { .. } => "addSourceBuffer",
            ControlCall::RemoveSourceBuffer { .. } => "removeSourceBuffer",
            ControlCall::AbortSourceBuffer { .. } => "abortSourceBuffer",
            ControlCall::AppendBuffer { .. } => "appendBuffer",
            ControlCall::SetAppendMode { .. } => "setAppendMode",
            ControlCall::SetAppendTimestampOffset { .. } => "setAppendTimestampOffset",
            ControlCall::RemoveBufferRange { .. } => "removeBufferRange",
            ControlCall::ChangeSourceBufferType { .. } => "changeSourceBufferType",
            ControlCall::RemoveInstance => "removeInstance",
            ControlCall::CloseSession => "closeSession",
            ControlCall::SendMessage { .. } => "sendMessage",
            ControlCall::OnPageLoad => "onPageLoad",
            ControlCall::OnAddressBarChanged { .. } => "onAddressBarChanged",
            ControlCall::OnTitleChanged { .. } => "onTitleChanged",
            ControlCall::OnPageClose => "onPageClose",
        }
    }
}

/// Outcome of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseResult {
    Ok,
    Error,
}

/// Reply to one [`ControlRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub request_id: String,
    pub result: ResponseResult,
    /// Host status: 0 on success, the error's code otherwise.
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl ControlResponse {
    pub fn ok(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: ResponseResult::Ok,
            status: 0,
            error: None,
            message: None,
            value,
        }
    }

    pub fn error(request_id: impl Into<String>, err: &EngineError) -> Self {
        Self {
            request_id: request_id.into(),
            result: ResponseResult::Error,
            status: err.status_code(),
            error: Some(err.name().to_string()),
            message: Some(err.to_string()),
            value: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == ResponseResult::Ok
    }
}

fn buffered_value(ranges: &TimeRanges) -> Value {
    json!(ranges.to_arrays())
}

impl Engine {
    /// Execute a control request.
    pub fn handle(&self, request: &ControlRequest) -> ControlResponse {
        debug!(
            request = %request.request_id,
            session = %request.session_id,
            instance = %request.instance_id,
            service = request.call.service(),
            "Handling request"
        );
        match self.execute(request) {
            Ok(value) => ControlResponse::ok(request.request_id.clone(), value),
            Err(err) => {
                debug!(request = %request.request_id, %err, "Request failed");
                ControlResponse::error(request.request_id.clone(), &err)
            }
        }
    }

    fn execute(&self, request: &ControlRequest) -> EngineResult<Value> {
        let s = request.session_id.as_str();
        let i = request.instance_id.as_str();

        let value = match &request.call {
            ControlCall::Load { url } => {
                self.load(s, i, url)?;
                Value::Null
            }
            ControlCall::CancelLoad => json!(self.cancel_load(s, i)?),
            ControlCall::Pause => {
                self.pause(s, i)?;
                Value::Null
            }
            ControlCall::Play => {
                self.play(s, i)?;
                Value::Null
            }
            ControlCall::Seek { time } => {
                self.seek(s, i, *time)?;
                Value::Null
            }
            ControlCall::GetPaused => json!(self.get_paused(s, i)?),
            ControlCall::GetSeeking => json!(self.get_seeking(s, i)?),
            // NaN and infinity have no JSON form and serialize as null.
            ControlCall::GetDuration => json!(self.get_duration(s, i)?),
            ControlCall::GetCurrentTime => json!(self.get_current_time(s, i)?),
            ControlCall::GetNetworkState => json!(self.get_network_state(s, i)?.code()),
            ControlCall::GetReadyState => json!(self.get_ready_state(s, i)?.code()),
            ControlCall::GetMaxTimeSeekable => json!(self.get_max_time_seekable(s, i)?),
            ControlCall::GetBuffered => buffered_value(&self.get_buffered(s, i)?),
            ControlCall::GetVisible => json!(self.get_visible(s, i)?),
            ControlCall::SetRect {
                x,
                y,
                width,
                height,
            } => {
                self.set_rect(s, i, *x, *y, *width, *height)?;
                Value::Null
            }
            ControlCall::SetVisible { visible } => {
                self.set_visible(s, i, *visible)?;
                Value::Null
            }
            ControlCall::AddSourceBuffer {
                source_id,
                mime_type,
            } => {
                self.add_source_buffer(s, i, source_id, mime_type)?;
                Value::Null
            }
            ControlCall::RemoveSourceBuffer { source_id } => {
                self.remove_source_buffer(s, i, source_id)?;
                Value::Null
            }
            ControlCall::AbortSourceBuffer { source_id } => {
                self.abort_source_buffer(s, i, source_id)?;
                Value::Null
            }
            ControlCall::AppendBuffer {
                source_id,
                append_window_start,
                append_window_end,
                buffer_id,
                offset,
                length,
                payload,
            } => {
                let default_window = AppendWindow::default();
                let append = AppendRequest {
                    buffer_id: *buffer_id,
                    payload,
                    offset: *offset,
                    length: length.unwrap_or_else(|| payload.len().saturating_sub(*offset)),
                    window: AppendWindow::new(
                        append_window_start.unwrap_or(default_window.start),
                        append_window_end.unwrap_or(default_window.end),
                    ),
                };
                let ranges: TimeRanges = self
                    .append_buffer(s, i, source_id, append)?
                    .into_iter()
                    .collect();
                buffered_value(&ranges)
            }
            ControlCall::SetAppendMode { source_id, mode } => {
                self.set_append_mode(s, i, source_id, *mode)?;
                Value::Null
            }
            ControlCall::SetAppendTimestampOffset { source_id, offset } => {
                self.set_append_timestamp_offset(s, i, source_id, *offset)?;
                Value::Null
            }
            ControlCall::RemoveBufferRange {
                source_id,
                start,
                end,
            } => {
                let ranges: TimeRanges = self
                    .remove_buffer_range(s, i, source_id, *start, *end)?
                    .into_iter()
                    .collect();
                buffered_value(&ranges)
            }
            ControlCall::ChangeSourceBufferType {
                source_id,
                mime_type,
            } => {
                self.change_source_buffer_type(s, i, source_id, mime_type)?;
                Value::Null
            }
            ControlCall::RemoveInstance => {
                self.remove_instance(s, i)?;
                Value::Null
            }
            ControlCall::CloseSession => {
                self.close_session(s)?;
                Value::Null
            }
            ControlCall::SendMessage { message } => json!(self.send_message(s, message)?),
            ControlCall::OnPageLoad => {
                self.page_event(s, &PageEvent::Load)?;
                Value::Null
            }
            ControlCall::OnAddressBarChanged { url } => {
                self.page_event(s, &PageEvent::AddressBarChanged { url: url.clone() })?;
                Value::Null
            }
            ControlCall::OnTitleChanged { title } => {
                self.page_event(s, &PageEvent::TitleChanged { title: title.clone() })?;
                Value::Null
            }
            ControlCall::OnPageClose => {
                self.page_event(s, &PageEvent::Close)?;
                Value::Null
            }
        };
        Ok(value)
    }
}
