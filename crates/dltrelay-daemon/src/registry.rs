//! Applications and contexts known to the daemon, grouped per ECU.
//!
//! Both tables are sorted vectors: applications by apid, contexts by
//! (apid, ctid). Lookups range-check against the first and last key before
//! binary searching. Removal shifts the tail left so the order survives.

use std::collections::BTreeMap;
use std::ops::Range;

use dltrelay_frame::Id4;
use dltrelay_transport::ConnectionId;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// Applications are reserved in chunks of this many entries.
pub const APPLICATION_ALLOC_SIZE: usize = 500;
/// Contexts are reserved in chunks of this many entries.
pub const CONTEXT_ALLOC_SIZE: usize = 1000;

pub const LOG_LEVEL_DEFAULT: i8 = -1;
pub const LOG_LEVEL_OFF: i8 = 0;
pub const LOG_LEVEL_VERBOSE: i8 = 6;
pub const TRACE_STATUS_DEFAULT: i8 = -1;
pub const TRACE_STATUS_OFF: i8 = 0;
pub const TRACE_STATUS_ON: i8 = 1;

/// A registered producer application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub apid: Id4,
    pub ecu: Id4,
    /// Producer process id; 0 when unknown (loaded from the runtime files).
    pub pid: u32,
    pub description: String,
    /// Connection used to push level changes back to the producer.
    pub channel: Option<ConnectionId>,
    pub context_count: usize,
}

/// A log context of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub apid: Id4,
    pub ctid: Id4,
    /// -1 default, 0 off, 1 fatal ..= 6 verbose.
    pub log_level: i8,
    /// -1 default, 0 off, 1 on.
    pub trace_status: i8,
    /// Slot in the producer's own level table; level pushes address it.
    pub log_level_pos: i32,
    pub channel: Option<ConnectionId>,
    pub description: String,
}

impl Context {
    /// Level a producer should apply, with "default" resolved.
    pub fn effective_log_level(&self, settings: &RegistrySettings) -> i8 {
        if self.log_level == LOG_LEVEL_DEFAULT {
            settings.default_log_level
        } else {
            self.log_level
        }
    }

    pub fn effective_trace_status(&self, settings: &RegistrySettings) -> i8 {
        if self.trace_status == TRACE_STATUS_DEFAULT {
            settings.default_trace_status
        } else {
            self.trace_status
        }
    }
}

/// Everything a producer sends when it registers a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRegistration {
    pub apid: Id4,
    pub ctid: Id4,
    pub log_level: i8,
    pub trace_status: i8,
    pub log_level_pos: i32,
    pub channel: Option<ConnectionId>,
    pub description: String,
}

/// The applications and contexts of one ECU.
#[derive(Debug, Clone)]
pub struct UserList {
    ecu: Id4,
    applications: Vec<Application>,
    contexts: Vec<Context>,
}

impl UserList {
    fn new(ecu: Id4) -> Self {
        Self {
            ecu,
            applications: Vec::new(),
            contexts: Vec::new(),
        }
    }

    pub fn ecu(&self) -> Id4 {
        self.ecu
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    fn application_index(&self, apid: Id4) -> Option<usize> {
        let first = self.applications.first()?;
        let last = self.applications.last()?;
        if apid < first.apid || apid > last.apid {
            return None;
        }
        self.applications
            .binary_search_by(|app| app.apid.cmp(&apid))
            .ok()
    }

    fn context_index(&self, apid: Id4, ctid: Id4) -> Option<usize> {
        let key = (apid, ctid);
        let first = self.contexts.first()?;
        let last = self.contexts.last()?;
        if key < (first.apid, first.ctid) || key > (last.apid, last.ctid) {
            return None;
        }
        self.contexts
            .binary_search_by(|ctx| (ctx.apid, ctx.ctid).cmp(&key))
            .ok()
    }

    fn context_range(&self, apid: Id4) -> Range<usize> {
        let start = self.contexts.partition_point(|ctx| ctx.apid < apid);
        let end = self.contexts.partition_point(|ctx| ctx.apid <= apid);
        start..end
    }
}

/// Daemon-wide values the registry consults while registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub default_log_level: i8,
    pub default_trace_status: i8,
    /// Clamp registered levels and statuses to the defaults.
    pub force_ceiling: bool,
    /// Persisted context levels were loaded at startup and win over
    /// re-registrations.
    pub runtime_config_loaded: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_log_level: 4,
            default_trace_status: TRACE_STATUS_OFF,
            force_ceiling: false,
            runtime_config_loaded: false,
        }
    }
}

impl RegistrySettings {
    /// Level and status lowered to the defaults under `force_ceiling`.
    /// `None` when nothing had to change.
    fn clamp(&self, log_level: i8, trace_status: i8) -> Option<(i8, i8)> {
        if !self.force_ceiling {
            return None;
        }
        let clamped = (
            log_level.min(self.default_log_level),
            trace_status.min(self.default_trace_status),
        );
        (clamped != (log_level, trace_status)).then_some(clamped)
    }
}

/// Directory of producers and their contexts.
#[derive(Debug, Default)]
pub struct Registry {
    user_lists: BTreeMap<Id4, UserList>,
    settings: RegistrySettings,
    released: Vec<ConnectionId>,
}

pub fn validate_log_level(level: i8) -> Result<i8> {
    if (LOG_LEVEL_DEFAULT..=LOG_LEVEL_VERBOSE).contains(&level) {
        Ok(level)
    } else {
        Err(DaemonError::InvalidLogLevel(level))
    }
}

pub fn validate_trace_status(status: i8) -> Result<i8> {
    if (TRACE_STATUS_DEFAULT..=TRACE_STATUS_ON).contains(&status) {
        Ok(status)
    } else {
        Err(DaemonError::InvalidTraceStatus(status))
    }
}

fn reserve_chunk<T>(items: &mut Vec<T>, chunk: usize) {
    if items.len() == items.capacity() {
        items.reserve_exact(chunk);
    }
}

impl Registry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            user_lists: BTreeMap::new(),
            settings,
            released: Vec::new(),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut RegistrySettings {
        &mut self.settings
    }

    pub fn find_user_list(&self, ecu: Id4) -> Option<&UserList> {
        self.user_lists.get(&ecu)
    }

    pub fn user_lists(&self) -> impl Iterator<Item = &UserList> {
        self.user_lists.values()
    }

    /// Register `apid` or refresh an existing registration.
    ///
    /// The last registration wins for pid, description and channel. A
    /// re-registration from another process releases the channel of the
    /// previous one (see [`Registry::take_released`]).
    pub fn add_application(
        &mut self,
        ecu: Id4,
        apid: Id4,
        pid: u32,
        description: &str,
        channel: Option<ConnectionId>,
    ) -> Result<&Application> {
        if apid.is_empty() {
            return Err(DaemonError::EmptyId);
        }

        let list = self
            .user_lists
            .entry(ecu)
            .or_insert_with(|| UserList::new(ecu));

        let index = match list.application_index(apid) {
            Some(index) => {
                let existing = &list.applications[index];
                if existing.pid != pid && existing.pid != 0 {
                    warn!(
                        ecu = %ecu,
                        apid = %apid,
                        pid,
                        existing_pid = existing.pid,
                        "duplicate registration of application"
                    );
                }
                index
            }
            None => {
                reserve_chunk(&mut list.applications, APPLICATION_ALLOC_SIZE);
                let index = list.applications.partition_point(|app| app.apid < apid);
                list.applications.insert(
                    index,
                    Application {
                        apid,
                        ecu,
                        pid: 0,
                        description: String::new(),
                        channel: None,
                        context_count: 0,
                    },
                );
                index
            }
        };

        let app = &mut list.applications[index];
        app.description = description.to_string();

        if app.channel.is_some() && app.pid != pid {
            if let Some(old) = app.channel.take() {
                self.released.push(old);
            }
            app.pid = 0;
        }

        if app.channel.is_none() && pid != 0 {
            app.pid = pid;
            app.channel = channel;
        }

        debug!(ecu = %ecu, apid = %apid, pid = app.pid, "application registered");
        Ok(&list.applications[index])
    }

    /// Remove `apid`. Its contexts stay; see
    /// [`Registry::remove_application_with_contexts`].
    pub fn remove_application(&mut self, ecu: Id4, apid: Id4) -> Result<Application> {
        let list = self
            .user_lists
            .get_mut(&ecu)
            .ok_or(DaemonError::ApplicationNotFound { ecu, apid })?;
        let index = list
            .application_index(apid)
            .ok_or(DaemonError::ApplicationNotFound { ecu, apid })?;
        let app = list.applications.remove(index);
        if let Some(channel) = app.channel {
            self.released.push(channel);
        }
        Ok(app)
    }

    pub fn remove_application_with_contexts(&mut self, ecu: Id4, apid: Id4) -> Result<Application> {
        if let Some(list) = self.user_lists.get_mut(&ecu) {
            let range = list.context_range(apid);
            list.contexts.drain(range);
        }
        let mut app = self.remove_application(ecu, apid)?;
        app.context_count = 0;
        Ok(app)
    }

    pub fn find_application(&self, ecu: Id4, apid: Id4) -> Option<&Application> {
        let list = self.user_lists.get(&ecu)?;
        list.application_index(apid)
            .map(|index| &list.applications[index])
    }

    /// Register a context of an already registered application.
    ///
    /// A re-registration keeps the stored level and status when persisted
    /// levels were loaded; otherwise the registration's values are taken.
    pub fn add_context(&mut self, ecu: Id4, registration: ContextRegistration) -> Result<&Context> {
        let ContextRegistration {
            apid,
            ctid,
            mut log_level,
            mut trace_status,
            log_level_pos,
            channel,
            description,
        } = registration;

        if apid.is_empty() || ctid.is_empty() {
            return Err(DaemonError::EmptyId);
        }
        validate_log_level(log_level)?;
        validate_trace_status(trace_status)?;

        let settings = self.settings;
        let list = self
            .user_lists
            .get_mut(&ecu)
            .ok_or(DaemonError::ApplicationNotFound { ecu, apid })?;
        let app_index = list
            .application_index(apid)
            .ok_or(DaemonError::ApplicationNotFound { ecu, apid })?;

        if let Some((level, status)) = settings.clamp(log_level, trace_status) {
            log_level = level;
            trace_status = status;
            info!(
                apid = %apid,
                ctid = %ctid,
                log_level,
                trace_status,
                "clamped context to default ceiling"
            );
        }

        let (index, is_new) = match list.context_index(apid, ctid) {
            Some(index) => (index, false),
            None => {
                reserve_chunk(&mut list.contexts, CONTEXT_ALLOC_SIZE);
                let index = list
                    .contexts
                    .partition_point(|ctx| (ctx.apid, ctx.ctid) < (apid, ctid));
                list.contexts.insert(
                    index,
                    Context {
                        apid,
                        ctid,
                        log_level,
                        trace_status,
                        log_level_pos,
                        channel: None,
                        description: String::new(),
                    },
                );
                list.applications[app_index].context_count += 1;
                (index, true)
            }
        };

        let ctx = &mut list.contexts[index];
        ctx.description = description;
        if is_new || !settings.runtime_config_loaded {
            ctx.log_level = log_level;
            ctx.trace_status = trace_status;
        }
        ctx.log_level_pos = log_level_pos;
        ctx.channel = channel;

        Ok(&list.contexts[index])
    }

    pub fn remove_context(&mut self, ecu: Id4, apid: Id4, ctid: Id4) -> Result<Context> {
        let list = self
            .user_lists
            .get_mut(&ecu)
            .ok_or(DaemonError::ContextNotFound { ecu, apid, ctid })?;
        let index = list
            .context_index(apid, ctid)
            .ok_or(DaemonError::ContextNotFound { ecu, apid, ctid })?;
        let ctx = list.contexts.remove(index);
        if let Some(app_index) = list.application_index(apid) {
            let app = &mut list.applications[app_index];
            app.context_count = app.context_count.saturating_sub(1);
        }
        Ok(ctx)
    }

    pub fn find_context(&self, ecu: Id4, apid: Id4, ctid: Id4) -> Option<&Context> {
        let list = self.user_lists.get(&ecu)?;
        list.context_index(apid, ctid)
            .map(|index| &list.contexts[index])
    }

    pub fn find_context_mut(&mut self, ecu: Id4, apid: Id4, ctid: Id4) -> Option<&mut Context> {
        let list = self.user_lists.get_mut(&ecu)?;
        let index = list.context_index(apid, ctid)?;
        Some(&mut list.contexts[index])
    }

    /// The contexts of `apid`, in ctid order.
    pub fn contexts_of(&self, ecu: Id4, apid: Id4) -> &[Context] {
        match self.user_lists.get(&ecu) {
            Some(list) => &list.contexts[list.context_range(apid)],
            None => &[],
        }
    }

    /// Disconnect every entry of `ecu` that still points at `channel`.
    ///
    /// Returns the number of entries touched.
    pub fn invalidate_channel(&mut self, ecu: Id4, channel: ConnectionId) -> usize {
        let Some(list) = self.user_lists.get_mut(&ecu) else {
            return 0;
        };
        let mut count = 0;
        for app in list
            .applications
            .iter_mut()
            .filter(|app| app.channel == Some(channel))
        {
            app.channel = None;
            count += 1;
        }
        for ctx in list
            .contexts
            .iter_mut()
            .filter(|ctx| ctx.channel == Some(channel))
        {
            ctx.channel = None;
            count += 1;
        }
        if count > 0 {
            debug!(ecu = %ecu, channel = %channel, entries = count, "invalidated channel");
        }
        count
    }

    /// Whether any entry of `ecu` still writes to `channel`.
    pub fn references_channel(&self, ecu: Id4, channel: ConnectionId) -> bool {
        self.user_lists.get(&ecu).is_some_and(|list| {
            list.applications
                .iter()
                .any(|app| app.channel == Some(channel))
                || list.contexts.iter().any(|ctx| ctx.channel == Some(channel))
        })
    }

    /// Channels given up by re-registration or removal since the last call.
    pub fn take_released(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.released)
    }

    /// Set a context's level. Returns the previous value.
    pub fn set_context_level(&mut self, ecu: Id4, apid: Id4, ctid: Id4, level: i8) -> Result<i8> {
        validate_log_level(level)?;
        let ctx = self
            .find_context_mut(ecu, apid, ctid)
            .ok_or(DaemonError::ContextNotFound { ecu, apid, ctid })?;
        Ok(std::mem::replace(&mut ctx.log_level, level))
    }

    /// Set a context's trace status. Returns the previous value.
    pub fn set_context_status(
        &mut self,
        ecu: Id4,
        apid: Id4,
        ctid: Id4,
        status: i8,
    ) -> Result<i8> {
        validate_trace_status(status)?;
        let ctx = self
            .find_context_mut(ecu, apid, ctid)
            .ok_or(DaemonError::ContextNotFound { ecu, apid, ctid })?;
        Ok(std::mem::replace(&mut ctx.trace_status, status))
    }

    /// Drop every application and context of `ecu`.
    pub fn clear(&mut self, ecu: Id4) {
        if let Some(list) = self.user_lists.remove(&ecu) {
            self.released
                .extend(list.applications.iter().filter_map(|app| app.channel));
        }
    }
}
