//! Control requests from consumers.

use bytes::Bytes;
use dltrelay_frame::envelope::Injection;
use dltrelay_frame::service::{
    self, id, status, GetLogInfoRequest, InjectionRequest, LogInfoApplication, LogInfoContext,
    SetLevelRequest,
};
use dltrelay_frame::{Id4, Message, UserMessage};
use dltrelay_transport::ConnectionId;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, SendMode};
use crate::registry::{validate_log_level, validate_trace_status};

/// Which per-context value a set request changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    LogLevel,
    TraceStatus,
}

fn reply(service_id: u32, ok: bool) -> Bytes {
    service::encode_status(service_id, if ok { status::OK } else { status::ERROR })
}

impl Dispatcher {
    /// Answer one control request from consumer `source`.
    ///
    /// Every request gets exactly one response addressed to `source`.
    /// Messages that are not CONTROL/REQUEST are ignored.
    pub fn on_control_request(&mut self, source: ConnectionId, message: &Message) {
        if !message.is_control_request() {
            debug!(consumer = %source, "ignoring non-request message");
            return;
        }
        let big_endian = message.is_big_endian();
        let payload = &message.payload;
        let Some(service_id) = service::request_service_id(payload, big_endian) else {
            debug!(consumer = %source, "control request without service id");
            return;
        };
        debug!(
            consumer = %source,
            service = service::service_name(service_id),
            service_id,
            "control request"
        );

        let response = match service_id {
            id::SET_LOG_LEVEL => self.set_level(service_id, payload, big_endian, Target::LogLevel),
            id::SET_TRACE_STATUS => {
                self.set_level(service_id, payload, big_endian, Target::TraceStatus)
            }
            id::GET_LOG_INFO => self.get_log_info(payload, big_endian),
            id::GET_DEFAULT_LOG_LEVEL => service::encode_value(
                service_id,
                status::OK,
                self.registry.settings().default_log_level as u8,
            ),
            id::GET_DEFAULT_TRACE_STATUS => service::encode_value(
                service_id,
                status::OK,
                self.registry.settings().default_trace_status as u8,
            ),
            id::SET_DEFAULT_LOG_LEVEL => {
                self.set_default(service_id, payload, big_endian, Target::LogLevel)
            }
            id::SET_DEFAULT_TRACE_STATUS => {
                self.set_default(service_id, payload, big_endian, Target::TraceStatus)
            }
            id::SET_ALL_LOG_LEVEL => {
                self.set_all(service_id, payload, big_endian, Target::LogLevel)
            }
            id::SET_ALL_TRACE_STATUS => {
                self.set_all(service_id, payload, big_endian, Target::TraceStatus)
            }
            id::GET_TRACE_STATUS => self.get_trace_status(payload, big_endian),
            id::GET_SOFTWARE_VERSION => {
                service::encode_software_version(&self.config.software_version)
            }
            id::STORE_CONFIG => reply(service_id, self.store_config()),
            id::RESET_TO_FACTORY_DEFAULT => reply(service_id, self.reset_to_factory_default()),
            id::MESSAGE_BUFFER_OVERFLOW => {
                let counter = self.overflow_counter();
                service::encode_buffer_overflow(counter > 0, counter)
            }
            id::SET_TIMING_PACKETS => match service::parse_value_request(payload, big_endian) {
                Some(value) => {
                    self.timing_packets = value != 0;
                    info!(enabled = self.timing_packets, "timing packets");
                    reply(service_id, true)
                }
                None => reply(service_id, false),
            },
            id::GET_LOCAL_TIME => reply(service_id, true),
            id::SET_COM_INTERFACE_STATUS
            | id::SET_COM_INTERFACE_MAX_BANDWIDTH
            | id::SET_VERBOSE_MODE
            | id::SET_MESSAGE_FILTERING
            | id::USE_ECU_ID
            | id::USE_SESSION_ID
            | id::USE_TIMESTAMP
            | id::USE_EXTENDED_HEADER => service::encode_status(service_id, status::NOT_SUPPORTED),
            sid if sid >= id::INJECTION_MIN => {
                reply(service_id, self.inject(message, service_id, big_endian))
            }
            _ => service::encode_status(service_id, status::NOT_SUPPORTED),
        };

        if let Err(err) = self.send_control(SendMode::To(source), response) {
            debug!(consumer = %source, error = %err, "control response not sent");
        }
    }

    /// Contexts addressed by an apid/ctid pair, wildcards included.
    ///
    /// `ab*` with an empty ctid matches every apid starting with `ab`; an
    /// empty apid with `cd*` matches every ctid starting with `cd`. An apid
    /// alone selects all of its contexts, a ctid alone every context with
    /// that ctid.
    fn select_contexts(&self, apid: Id4, ctid: Id4) -> Vec<(Id4, Id4)> {
        let ecu = self.config.ecu_id;
        let Some(list) = self.registry.find_user_list(ecu) else {
            return Vec::new();
        };
        let contexts = list.contexts().iter();
        let keys = |ctx: &crate::registry::Context| (ctx.apid, ctx.ctid);

        match (apid.wildcard_prefix(), ctid.wildcard_prefix()) {
            (Some(prefix), None) if ctid.is_empty() => contexts
                .filter(|ctx| ctx.apid.starts_with(prefix))
                .map(keys)
                .collect(),
            (None, Some(prefix)) if apid.is_empty() => contexts
                .filter(|ctx| ctx.ctid.starts_with(prefix))
                .map(keys)
                .collect(),
            _ if apid.is_empty() && ctid.is_empty() => Vec::new(),
            _ if ctid.is_empty() => self
                .registry
                .contexts_of(ecu, apid)
                .iter()
                .map(keys)
                .collect(),
            _ if apid.is_empty() => contexts.filter(|ctx| ctx.ctid == ctid).map(keys).collect(),
            _ => self
                .registry
                .find_context(ecu, apid, ctid)
                .map(keys)
                .into_iter()
                .collect(),
        }
    }

    fn set_level(
        &mut self,
        service_id: u32,
        payload: &[u8],
        big_endian: bool,
        target: Target,
    ) -> Bytes {
        let Some(request) = SetLevelRequest::parse(payload, big_endian) else {
            return reply(service_id, false);
        };
        let value = request.value as i8;
        let settings = *self.registry.settings();
        let (valid, ceiling) = match target {
            Target::LogLevel => (
                validate_log_level(value).is_ok(),
                settings.default_log_level,
            ),
            Target::TraceStatus => (
                validate_trace_status(value).is_ok(),
                settings.default_trace_status,
            ),
        };
        if !valid {
            warn!(service_id, value, "rejected out-of-range value");
            return reply(service_id, false);
        }
        let value = if settings.force_ceiling {
            value.min(ceiling)
        } else {
            value
        };

        let targets = self.select_contexts(request.apid, request.ctid);
        if targets.is_empty() {
            warn!(apid = %request.apid, ctid = %request.ctid, "no matching context");
            return reply(service_id, false);
        }

        let ecu = self.config.ecu_id;
        let mut ok = true;
        for (apid, ctid) in targets {
            let previous = match target {
                Target::LogLevel => self.registry.set_context_level(ecu, apid, ctid, value),
                Target::TraceStatus => self.registry.set_context_status(ecu, apid, ctid, value),
            };
            let Ok(previous) = previous else {
                ok = false;
                continue;
            };
            if self.push_log_level(apid, ctid) {
                info!(apid = %apid, ctid = %ctid, value, ?target, "context updated");
                continue;
            }
            warn!(apid = %apid, ctid = %ctid, "producer unreachable, reverting");
            let _ = match target {
                Target::LogLevel => self.registry.set_context_level(ecu, apid, ctid, previous),
                Target::TraceStatus => {
                    self.registry.set_context_status(ecu, apid, ctid, previous)
                }
            };
            ok = false;
        }
        reply(service_id, ok)
    }

    fn set_default(
        &mut self,
        service_id: u32,
        payload: &[u8],
        big_endian: bool,
        target: Target,
    ) -> Bytes {
        let Some(value) = service::parse_value_request(payload, big_endian) else {
            return reply(service_id, false);
        };
        let value = value as i8;
        let settings = self.registry.settings_mut();
        match target {
            Target::LogLevel if (0..=6).contains(&value) => settings.default_log_level = value,
            Target::TraceStatus if (0..=1).contains(&value) => {
                settings.default_trace_status = value
            }
            _ => {
                warn!(service_id, value, "rejected default value");
                return reply(service_id, false);
            }
        }
        info!(value, ?target, "default changed");
        self.push_default_update();
        reply(service_id, true)
    }

    fn set_all(
        &mut self,
        service_id: u32,
        payload: &[u8],
        big_endian: bool,
        target: Target,
    ) -> Bytes {
        let Some(value) = service::parse_value_request(payload, big_endian) else {
            return reply(service_id, false);
        };
        let value = value as i8;
        let valid = match target {
            Target::LogLevel => validate_log_level(value).is_ok(),
            Target::TraceStatus => validate_trace_status(value).is_ok(),
        };
        if !valid {
            return reply(service_id, false);
        }

        let ecu = self.config.ecu_id;
        let targets: Vec<(Id4, Id4)> = self
            .registry
            .find_user_list(ecu)
            .map(|list| {
                list.contexts()
                    .iter()
                    .map(|ctx| (ctx.apid, ctx.ctid))
                    .collect()
            })
            .unwrap_or_default();
        for (apid, ctid) in targets {
            let updated = match target {
                Target::LogLevel => self.registry.set_context_level(ecu, apid, ctid, value),
                Target::TraceStatus => self.registry.set_context_status(ecu, apid, ctid, value),
            };
            if updated.is_ok() {
                self.push_log_level(apid, ctid);
            }
        }
        reply(service_id, true)
    }

    fn get_trace_status(&self, payload: &[u8], big_endian: bool) -> Bytes {
        let service_id = id::GET_TRACE_STATUS;
        let Some((apid, ctid)) = service::parse_context_request(payload, big_endian) else {
            return reply(service_id, false);
        };
        let settings = self.registry.settings();
        match self.registry.find_context(self.config.ecu_id, apid, ctid) {
            Some(ctx) => service::encode_value(
                service_id,
                status::OK,
                ctx.effective_trace_status(settings) as u8,
            ),
            None => reply(service_id, false),
        }
    }

    fn get_log_info(&self, payload: &[u8], big_endian: bool) -> Bytes {
        let Some(request) = GetLogInfoRequest::parse(payload, big_endian) else {
            return reply(id::GET_LOG_INFO, false);
        };
        if !(3..=7).contains(&request.options) {
            return reply(id::GET_LOG_INFO, false);
        }
        service::encode_log_info(
            request.options,
            &self.collect_log_info(request.apid, request.ctid),
        )
    }

    /// Applications and contexts for a GET_LOG_INFO response. Empty ids
    /// match everything; with a ctid filter, applications without a
    /// matching context are left out.
    pub(crate) fn collect_log_info(&self, apid: Id4, ctid: Id4) -> Vec<LogInfoApplication> {
        let ecu = self.config.ecu_id;
        let Some(list) = self.registry.find_user_list(ecu) else {
            return Vec::new();
        };
        list.applications()
            .iter()
            .filter(|app| apid.is_empty() || app.apid == apid)
            .filter_map(|app| {
                let contexts: Vec<LogInfoContext> = self
                    .registry
                    .contexts_of(ecu, app.apid)
                    .iter()
                    .filter(|ctx| ctid.is_empty() || ctx.ctid == ctid)
                    .map(|ctx| LogInfoContext {
                        ctid: ctx.ctid,
                        log_level: ctx.log_level,
                        trace_status: ctx.trace_status,
                        description: ctx.description.clone(),
                    })
                    .collect();
                if contexts.is_empty() && !ctid.is_empty() {
                    return None;
                }
                Some(LogInfoApplication {
                    apid: app.apid,
                    description: app.description.clone(),
                    contexts,
                })
            })
            .collect()
    }

    fn store_config(&mut self) -> bool {
        let Some(store) = self.store.clone() else {
            warn!("store requested without a runtime directory");
            return false;
        };
        let ecu = self.config.ecu_id;
        if let Err(err) = store.save_applications(&self.registry, ecu) {
            warn!(error = %err, "applications not stored");
            return false;
        }
        if let Err(err) = store.save_contexts(&self.registry, ecu) {
            warn!(error = %err, "contexts not stored, resetting");
            self.reset_to_factory_default();
            return false;
        }
        info!(dir = ?store.dir(), "runtime configuration stored");
        true
    }

    /// Delete the runtime files and restore the configured defaults.
    fn reset_to_factory_default(&mut self) -> bool {
        let Some(store) = self.store.clone() else {
            warn!("reset requested without a runtime directory");
            return false;
        };
        if let Err(err) = store.reset() {
            warn!(error = %err, "runtime files not removed");
            return false;
        }
        let (level, status) = (self.config.default_log_level, self.config.default_trace_status);
        let settings = self.registry.settings_mut();
        settings.default_log_level = level;
        settings.default_trace_status = status;
        settings.runtime_config_loaded = false;
        info!("runtime configuration reset");
        self.push_default_update();
        true
    }

    /// Forward an injection to the producer owning the addressed context.
    fn inject(&mut self, message: &Message, service_id: u32, big_endian: bool) -> bool {
        let apid = message.apid().unwrap_or_default();
        let ctid = message.ctid().unwrap_or_default();
        let Some(request) = InjectionRequest::parse(&message.payload, big_endian) else {
            warn!(service_id, "truncated injection request");
            return false;
        };
        let Some(ctx) = self.registry.find_context(self.config.ecu_id, apid, ctid) else {
            warn!(apid = %apid, ctid = %ctid, "injection for unknown context");
            return false;
        };
        let (Some(channel), true) = (ctx.channel, ctx.log_level_pos >= 0) else {
            warn!(apid = %apid, ctid = %ctid, "injection target unreachable");
            return false;
        };
        let injection = UserMessage::Injection(Injection {
            log_level_pos: ctx.log_level_pos,
            service_id: request.service_id,
            data: request.data,
        });
        self.write_producer(channel, &injection)
    }
}
