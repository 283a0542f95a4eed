//! Server orchestrator.
//!
//! The server owns the program map, the per-principal accounts, and the
//! anonymous instance set, all guarded by one lock. Public operations
//! authorize, manipulate the object graph under the lock, and hand blocking
//! work (process serving, source fetches) to tasks that run without it.

pub mod access;
pub mod account;
pub mod events;
pub mod instance;
pub mod inventory;
pub mod program;
pub mod source;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    Features, InstanceInfo, InstanceUpdate, LaunchOptions, ModuleInfo, ModuleOptions,
    ModuleUpload, ResumeOptions, State, Status, DebugRequest, DebugResponse,
    KNOWN_MODULE_SOURCE,
};
use crate::builder::{build_known_program, build_program, hash_module_bytes, rebuild_program_image, ModuleLoader};
use crate::image::storage::{ImageStorage, MemoryStorage};
use crate::runtime::{DebugLog, ProcessFactory, ServiceFactory};
use crate::server::access::{Authorizer, InstancePolicy, OpContext, ProgramPolicy, PublicAccess, MAX_SCOPE};
use crate::server::account::{Account, AccountInstance};
use crate::server::events::{Event, EventType, InstanceRecord, LogMonitor, Meta, Monitor};
use crate::server::instance::{final_status, DebugPhase, Instance};
use crate::server::inventory::{Inventory, MemoryInventory};
use crate::server::program::{Program, ProgramRef};
use crate::server::source::{MemorySourceCache, SourceCache, SourceContent, SourceSet};
use crate::trap::Trap;
use crate::types::config::DefaultLimits;
use crate::types::{Config, Error, FailKind, InstanceId, ModuleId, PrincipalId, Result};

/// Opens a debug-log sink from an invoke option string.
pub type DebugLogOpener = dyn Fn(&str) -> Option<DebugLog> + Send + Sync;

// ============================================================================
// Builder
// ============================================================================

/// Wires the server's collaborators. Loader, process factory, and service
/// factory have no defaults; everything else falls back to an in-memory or
/// permissive implementation.
pub struct ServerBuilder {
    config: Config,
    loader: Option<Arc<dyn ModuleLoader>>,
    process_factory: Option<Arc<dyn ProcessFactory>>,
    service_factory: Option<Arc<dyn ServiceFactory>>,
    storage: Arc<dyn ImageStorage>,
    authorizer: Arc<dyn Authorizer>,
    sources: SourceSet,
    source_cache: Arc<dyn SourceCache>,
    inventory: Arc<dyn Inventory>,
    monitor: Arc<dyn Monitor>,
    debug_log_opener: Option<Arc<DebugLogOpener>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        let limits = config.limits.clone();
        Self {
            config,
            loader: None,
            process_factory: None,
            service_factory: None,
            storage: Arc::new(MemoryStorage::new()),
            authorizer: Arc::new(PublicAccess::new(limits)),
            sources: SourceSet::new(),
            source_cache: Arc::new(MemorySourceCache::default()),
            inventory: Arc::new(MemoryInventory::default()),
            monitor: Arc::new(LogMonitor),
            debug_log_opener: None,
        }
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn process_factory(mut self, factory: Arc<dyn ProcessFactory>) -> Self {
        self.process_factory = Some(factory);
        self
    }

    pub fn service_factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.service_factory = Some(factory);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn ImageStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn sources(mut self, sources: SourceSet) -> Self {
        self.sources = sources;
        self
    }

    pub fn source_cache(mut self, cache: Arc<dyn SourceCache>) -> Self {
        self.source_cache = cache;
        self
    }

    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn debug_log_opener(mut self, opener: Arc<DebugLogOpener>) -> Self {
        self.debug_log_opener = Some(opener);
        self
    }

    /// Construct the server, loading every stored program into the map.
    /// Objects that disappear between listing and open are skipped.
    pub async fn build(self) -> Result<Server> {
        let loader = self
            .loader
            .ok_or_else(|| Error::internal("server requires a module loader"))?;
        let process_factory = self
            .process_factory
            .ok_or_else(|| Error::internal("server requires a process factory"))?;
        let service_factory = self
            .service_factory
            .ok_or_else(|| Error::internal("server requires a service factory"))?;

        let mut programs = HashMap::new();
        for id in self.storage.list_programs().await? {
            let Some(content) = self.storage.load_program(&id).await? else {
                continue;
            };
            match build_known_program(loader.as_ref(), &self.config.limits, &id, content, false) {
                Ok(built) => {
                    let prog = Program::new(built.id.clone(), built.image, true);
                    programs.insert(built.id, prog.into_program());
                }
                Err(err) => {
                    warn!(module = %id, error = %err, "stored_program_load_failed");
                }
            }
        }
        info!(programs = programs.len(), "server_programs_loaded");

        // Stored instance state is not rehydrated into running objects; a
        // terminal status is derived when the instance is next started.
        for key in self.storage.list_instances().await? {
            debug!(key = %key, "stored_instance_found");
        }

        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                loader,
                process_factory,
                service_factory,
                storage: self.storage,
                authorizer: self.authorizer,
                sources: self.sources,
                source_cache: self.source_cache,
                inventory: self.inventory,
                monitor: self.monitor,
                debug_log_opener: self.debug_log_opener,
                request_counter: AtomicU64::new(0),
                state: Mutex::new(ServerState {
                    closed: false,
                    programs,
                    accounts: HashMap::new(),
                    anonymous: HashMap::new(),
                }),
            }),
        })
    }
}

// ============================================================================
// Server
// ============================================================================

struct ServerState {
    closed: bool,
    /// Each entry owns one unit of its program's reference count.
    programs: HashMap<ModuleId, Arc<Program>>,
    accounts: HashMap<PrincipalId, Account>,
    /// Instances with no principal; killed on shutdown.
    anonymous: HashMap<InstanceId, AccountInstance>,
}

impl ServerState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ServerClosed);
        }
        Ok(())
    }

    fn account_mut(&mut self, pri: &PrincipalId) -> &mut Account {
        self.accounts
            .entry(pri.clone())
            .or_insert_with(|| Account::new(pri.clone()))
    }

    /// Insert a freshly built program, deduplicated by id. Returns the
    /// canonical program and whether the caller's copy was redundant.
    fn merge_program_ref(&mut self, prog_ref: ProgramRef) -> (Arc<Program>, bool) {
        let id = prog_ref.id().clone();
        match self.programs.get(&id) {
            None => {
                let prog = prog_ref.into_program();
                self.programs.insert(id, prog.clone());
                (prog, false)
            }
            Some(existing) if Arc::ptr_eq(existing, prog_ref.program()) => {
                let existing = existing.clone();
                prog_ref.unref();
                (existing, false)
            }
            Some(existing) => {
                let existing = existing.clone();
                prog_ref.unref();
                (existing, true)
            }
        }
    }
}

struct ServerInner {
    config: Config,
    loader: Arc<dyn ModuleLoader>,
    process_factory: Arc<dyn ProcessFactory>,
    service_factory: Arc<dyn ServiceFactory>,
    storage: Arc<dyn ImageStorage>,
    authorizer: Arc<dyn Authorizer>,
    sources: SourceSet,
    source_cache: Arc<dyn SourceCache>,
    inventory: Arc<dyn Inventory>,
    monitor: Arc<dyn Monitor>,
    debug_log_opener: Option<Arc<DebugLogOpener>>,
    request_counter: AtomicU64,
    state: Mutex<ServerState>,
}

/// The server core. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish()
    }
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Capability listing for façades.
    pub fn features(&self) -> Features {
        let mut module_sources = vec![KNOWN_MODULE_SOURCE.to_string()];
        module_sources.extend(self.inner.sources.prefixes());
        Features {
            scope: Vec::new(),
            module_sources,
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inner.inventory
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn next_request_id(&self, ctx: &mut OpContext) {
        if ctx.request_id == 0 {
            ctx.request_id = self.inner.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    fn emit(&self, event: Event) {
        self.inner.monitor.event(&event);
    }

    fn report_error(&self, meta: Meta, err: &Error) {
        if err.is_internal() {
            self.emit(Event::fail_internal(meta, "server", err));
        } else if let Some(kind) = err.fail_kind() {
            self.emit(Event::fail_request(meta, kind));
        }
    }

    fn finish<T>(&self, ctx: &OpContext, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.report_error(ctx.meta(), err);
        }
        result
    }

    fn program_policy(&self) -> ProgramPolicy {
        let limits = &self.inner.config.limits;
        ProgramPolicy {
            max_module_size: limits.max_module_size,
            max_text_size: limits.max_text_size,
            max_stack_size: limits.max_stack_size,
        }
    }

    fn instance_policy(&self) -> InstancePolicy {
        let limits = &self.inner.config.limits;
        InstancePolicy {
            max_memory_size: limits.max_memory_size,
            max_breakpoints: limits.max_breakpoints,
            time_resolution: limits.time_resolution,
        }
    }

    fn build_limits(prog: &ProgramPolicy, inst: Option<&InstancePolicy>) -> DefaultLimits {
        DefaultLimits {
            max_module_size: prog.max_module_size,
            max_text_size: prog.max_text_size,
            max_stack_size: prog.max_stack_size,
            max_memory_size: inst.map_or(usize::MAX, |i| i.max_memory_size),
            max_breakpoints: inst.map_or(usize::MAX, |i| i.max_breakpoints),
            time_resolution: inst.map_or(std::time::Duration::ZERO, |i| i.time_resolution),
        }
    }

    fn open_debug_log(&self, option: &str) -> Option<DebugLog> {
        if option.is_empty() {
            return None;
        }
        self.inner
            .debug_log_opener
            .as_ref()
            .and_then(|opener| opener(option))
    }

    /// An upload alleging the hash of a live program must also carry its
    /// length. Caught before any bytes are read.
    async fn check_known_upload_size(&self, upload: &ModuleUpload) -> Result<()> {
        if upload.hash.is_empty() {
            return Ok(());
        }
        let known_size = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            state
                .programs
                .get(&ModuleId::from_digest(upload.hash.clone()))
                .map(|prog| prog.image().map(|image| image.module_size()))
                .transpose()?
        };
        if let Some(size) = known_size {
            if upload.length != size {
                return Err(Error::module_error("module size mismatch"));
            }
        }
        Ok(())
    }

    /// Look up an existing program, or fall back to storage for a known
    /// module that is not currently referenced. Returns one count unit.
    async fn ref_program(&self, id: &ModuleId) -> Result<ProgramRef> {
        {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            if let Some(prog) = state.programs.get(id) {
                return Ok(prog.add_ref());
            }
        }

        // Known-module fast path: rebuild from stored content.
        let Some(content) = self.inner.storage.load_program(id).await? else {
            return Err(Error::ModuleNotFound);
        };
        let built =
            build_known_program(self.inner.loader.as_ref(), &self.inner.config.limits, id, content, false)?;
        let prog_ref = Program::new(built.id, built.image, true);

        let mut state = self.inner.state.lock().await;
        if let Err(err) = state.check_open() {
            prog_ref.unref();
            return Err(err);
        }
        let (prog, _) = state.merge_program_ref(prog_ref);
        Ok(prog.add_ref())
    }

    async fn get_instance(&self, ctx: &OpContext, id: &InstanceId) -> Result<Arc<Instance>> {
        let state = self.inner.state.lock().await;
        state.check_open()?;
        let found = match &ctx.principal {
            Some(pri) => state
                .accounts
                .get(pri)
                .and_then(|account| account.instance(id)),
            None => state.anonymous.get(id).map(|record| record.inst.clone()),
        };
        found.ok_or(Error::InstanceNotFound)
    }

    // ========================================================================
    // Module operations
    // ========================================================================

    /// Register an uploaded module, validating its alleged hash if present.
    pub async fn upload_module(
        &self,
        ctx: &mut OpContext,
        mut upload: ModuleUpload,
        opts: ModuleOptions,
    ) -> Result<ModuleId> {
        self.next_request_id(ctx);
        let result = self.upload_module_inner(ctx, &mut upload, &opts).await;
        self.finish(ctx, result)
    }

    async fn upload_module_inner(
        &self,
        ctx: &mut OpContext,
        upload: &mut ModuleUpload,
        opts: &ModuleOptions,
    ) -> Result<ModuleId> {
        let mut policy = self.program_policy();
        self.inner.authorizer.authorize_program(ctx, &mut policy).await?;
        if opts.pin && ctx.principal.is_none() {
            return Err(Error::unauthenticated("anonymous caller cannot pin modules"));
        }
        self.check_known_upload_size(upload).await?;

        let limits = Self::build_limits(&policy, None);
        let built = build_program(self.inner.loader.as_ref(), &limits, upload, false).await?;
        let prog_ref = Program::new(built.id.clone(), built.image, false);

        if opts.pin {
            if let Err(err) = prog_ref
                .program()
                .ensure_storage(self.inner.storage.as_ref())
                .await
            {
                prog_ref.unref();
                return Err(err);
            }
        }

        let id = built.id;
        let redundant = {
            let mut state = self.inner.state.lock().await;
            if let Err(err) = state.check_open() {
                prog_ref.unref();
                return Err(err);
            }
            let (prog, redundant) = state.merge_program_ref(prog_ref);
            if opts.pin {
                if let Some(pri) = &ctx.principal {
                    state.account_mut(&pri.clone()).ensure_program_ref(&prog, &opts.tags);
                }
            }
            redundant
        };

        let typ = if redundant {
            EventType::ModuleUploadExist
        } else {
            EventType::ModuleUploadNew
        };
        let tag_count = opts.pin.then_some(opts.tags.len());
        self.emit(Event::new(typ, ctx.meta()).with_module(id.clone(), tag_count));
        Ok(id)
    }

    /// Fetch a module from a registered source URI and register it.
    pub async fn source_module(
        &self,
        ctx: &mut OpContext,
        uri: &str,
        opts: ModuleOptions,
    ) -> Result<ModuleId> {
        self.next_request_id(ctx);
        let result = self.source_module_inner(ctx, uri, &opts).await;
        self.finish(ctx, result)
    }

    async fn source_module_inner(
        &self,
        ctx: &mut OpContext,
        uri: &str,
        opts: &ModuleOptions,
    ) -> Result<ModuleId> {
        let mut policy = self.program_policy();
        self.inner
            .authorizer
            .authorize_program_source(ctx, &mut policy, None, uri)
            .await?;
        if opts.pin && ctx.principal.is_none() {
            return Err(Error::unauthenticated("anonymous caller cannot pin modules"));
        }

        let source = self.inner.sources.get(uri)?;
        let canonical = source.canonical_uri(uri)?;

        // Advisory cache: short-circuit only when the cached id resolves to
        // a live program.
        if let Some(cached) = self.inner.source_cache.get_source(&canonical).await? {
            let live = {
                let state = self.inner.state.lock().await;
                state.check_open()?;
                state.programs.get(&cached).map(Program::add_ref)
            };
            if let Some(prog_ref) = live {
                return self
                    .register_sourced(ctx, prog_ref, opts, true)
                    .await;
            }
        }

        let content = source.open_uri(&canonical, policy.max_module_size).await?;
        let (stream, length) = match content {
            SourceContent::Found { stream, length } => (stream, length),
            SourceContent::TooLarge => {
                return Err(Error::resource_limit("module size limit exceeded"))
            }
            SourceContent::NotFound => return Err(Error::ModuleNotFound),
        };

        let limits = Self::build_limits(&policy, None);
        let mut upload = ModuleUpload::new(stream, length, String::new());
        let built = build_program(self.inner.loader.as_ref(), &limits, &mut upload, false).await?;
        let id = built.id.clone();
        let prog_ref = Program::new(built.id, built.image, false);

        if let Err(err) = self.inner.source_cache.put_source(&canonical, &id).await {
            self.emit(Event::fail_internal(ctx.meta(), "source cache", &err));
        }

        self.register_sourced(ctx, prog_ref, opts, false).await
    }

    async fn register_sourced(
        &self,
        ctx: &OpContext,
        prog_ref: ProgramRef,
        opts: &ModuleOptions,
        cached: bool,
    ) -> Result<ModuleId> {
        if opts.pin {
            if let Err(err) = prog_ref
                .program()
                .ensure_storage(self.inner.storage.as_ref())
                .await
            {
                prog_ref.unref();
                return Err(err);
            }
        }
        let id = prog_ref.id().clone();
        let redundant = {
            let mut state = self.inner.state.lock().await;
            if let Err(err) = state.check_open() {
                prog_ref.unref();
                return Err(err);
            }
            let (prog, redundant) = state.merge_program_ref(prog_ref);
            if opts.pin {
                if let Some(pri) = &ctx.principal {
                    state.account_mut(&pri.clone()).ensure_program_ref(&prog, &opts.tags);
                }
            }
            redundant
        };
        let typ = if redundant || cached {
            EventType::ModuleSourceExist
        } else {
            EventType::ModuleSourceNew
        };
        let tag_count = opts.pin.then_some(opts.tags.len());
        self.emit(Event::new(typ, ctx.meta()).with_module(id.clone(), tag_count));
        Ok(id)
    }

    /// Non-secret metadata of a pinned module.
    pub async fn module_info(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<ModuleInfo> {
        self.next_request_id(ctx);
        let result = self.module_info_inner(ctx, module).await;
        self.finish(ctx, result)
    }

    async fn module_info_inner(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<ModuleInfo> {
        self.inner.authorizer.authorize(ctx).await?;
        let pri = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::unauthenticated("module listing requires a principal"))?;

        let info = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            state
                .accounts
                .get(&pri)
                .and_then(|account| account.program_info(module))
        };
        let info = info.ok_or(Error::ModuleNotFound)?;
        self.emit(Event::new(EventType::ModuleInfo, ctx.meta()).with_module(module.clone(), None));
        Ok(info)
    }

    /// Modules pinned by the calling principal.
    pub async fn modules(&self, ctx: &mut OpContext) -> Result<Vec<ModuleInfo>> {
        self.next_request_id(ctx);
        let result = self.modules_inner(ctx).await;
        self.finish(ctx, result)
    }

    async fn modules_inner(&self, ctx: &mut OpContext) -> Result<Vec<ModuleInfo>> {
        self.inner.authorizer.authorize(ctx).await?;
        let pri = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::unauthenticated("module listing requires a principal"))?;

        let infos = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            state
                .accounts
                .get(&pri)
                .map(Account::modules)
                .unwrap_or_default()
        };
        self.emit(Event::new(EventType::ModuleList, ctx.meta()));
        Ok(infos)
    }

    /// Canonical module bytes. The returned buffer owns a copy of the
    /// content and outlives the program.
    pub async fn module_content(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<Bytes> {
        self.next_request_id(ctx);
        let result = self.module_content_inner(ctx, module).await;
        self.finish(ctx, result)
    }

    async fn module_content_inner(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<Bytes> {
        self.inner.authorizer.authorize(ctx).await?;
        let prog_ref = self.ref_program(module).await?;
        let content = prog_ref.program().module_bytes();
        prog_ref.unref();
        let content = content?;
        self.emit(
            Event::new(EventType::ModuleDownload, ctx.meta()).with_module(module.clone(), None),
        );
        Ok(content)
    }

    /// Pin a module to the calling principal's account. Idempotent; a
    /// repeat pin with identical tags emits no event.
    pub async fn pin_module(
        &self,
        ctx: &mut OpContext,
        module: &ModuleId,
        opts: ModuleOptions,
    ) -> Result<()> {
        self.next_request_id(ctx);
        let result = self.pin_module_inner(ctx, module, &opts).await;
        self.finish(ctx, result)
    }

    async fn pin_module_inner(
        &self,
        ctx: &mut OpContext,
        module: &ModuleId,
        opts: &ModuleOptions,
    ) -> Result<()> {
        let mut policy = self.program_policy();
        self.inner.authorizer.authorize_program(ctx, &mut policy).await?;
        let pri = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::unauthenticated("pinning requires a principal"))?;

        let reachable = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            state.accounts.get(&pri).is_some_and(|account| {
                account.program_info(module).is_some()
                    || account.instances().any(|inst| inst.module == *module)
            })
        };
        if !reachable {
            return Err(Error::ModuleNotFound);
        }

        let prog_ref = self.ref_program(module).await?;
        if let Err(err) = prog_ref
            .program()
            .ensure_storage(self.inner.storage.as_ref())
            .await
        {
            prog_ref.unref();
            return Err(err);
        }

        let changed = {
            let mut state = self.inner.state.lock().await;
            state.check_open()?;
            let changed = state
                .account_mut(&pri)
                .ensure_program_ref(prog_ref.program(), &opts.tags);
            prog_ref.unref();
            changed
        };
        if changed {
            self.emit(
                Event::new(EventType::ModulePin, ctx.meta())
                    .with_module(module.clone(), Some(opts.tags.len())),
            );
        }
        Ok(())
    }

    /// Drop the calling principal's pin. Unpinning an unpinned module is
    /// an error.
    pub async fn unpin_module(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<()> {
        self.next_request_id(ctx);
        let result = self.unpin_module_inner(ctx, module).await;
        self.finish(ctx, result)
    }

    async fn unpin_module_inner(&self, ctx: &mut OpContext, module: &ModuleId) -> Result<()> {
        self.inner.authorizer.authorize(ctx).await?;
        let pri = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::unauthenticated("unpinning requires a principal"))?;

        let found = {
            let mut state = self.inner.state.lock().await;
            state.check_open()?;
            state
                .accounts
                .get_mut(&pri)
                .map(|account| account.unref_program(module))
                .unwrap_or(false)
        };
        if !found {
            return Err(Error::ModuleNotFound);
        }
        self.emit(Event::new(EventType::ModuleUnpin, ctx.meta()).with_module(module.clone(), None));
        Ok(())
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Create an instance of a known module.
    pub async fn new_instance(
        &self,
        ctx: &mut OpContext,
        module: &ModuleId,
        launch: LaunchOptions,
    ) -> Result<InstanceInfo> {
        self.next_request_id(ctx);
        let result = self.new_instance_inner(ctx, module, launch).await;
        self.finish(ctx, result)
    }

    async fn new_instance_inner(
        &self,
        ctx: &mut OpContext,
        module: &ModuleId,
        launch: LaunchOptions,
    ) -> Result<InstanceInfo> {
        let mut prog_policy = self.program_policy();
        let mut inst_policy = self.instance_policy();
        self.inner
            .authorizer
            .authorize_program_instance(ctx, &mut prog_policy, &mut inst_policy)
            .await?;

        let prog_ref = self.ref_program(module).await?;
        let result = self
            .launch(ctx, prog_ref.program().clone(), &launch, &inst_policy, false)
            .await;
        prog_ref.unref();
        result
    }

    /// Upload a module and launch an instance of it in one pass.
    pub async fn upload_module_instance(
        &self,
        ctx: &mut OpContext,
        mut upload: ModuleUpload,
        mod_opts: ModuleOptions,
        launch: LaunchOptions,
    ) -> Result<(ModuleId, InstanceInfo)> {
        self.next_request_id(ctx);
        let result = self
            .upload_module_instance_inner(ctx, &mut upload, &mod_opts, launch)
            .await;
        self.finish(ctx, result)
    }

    async fn upload_module_instance_inner(
        &self,
        ctx: &mut OpContext,
        upload: &mut ModuleUpload,
        mod_opts: &ModuleOptions,
        launch: LaunchOptions,
    ) -> Result<(ModuleId, InstanceInfo)> {
        let mut prog_policy = self.program_policy();
        let mut inst_policy = self.instance_policy();
        self.inner
            .authorizer
            .authorize_program_instance(ctx, &mut prog_policy, &mut inst_policy)
            .await?;
        if mod_opts.pin && ctx.principal.is_none() {
            return Err(Error::unauthenticated("anonymous caller cannot pin modules"));
        }
        self.check_known_upload_size(upload).await?;

        let limits = Self::build_limits(&prog_policy, Some(&inst_policy));
        let built = build_program(self.inner.loader.as_ref(), &limits, upload, true).await?;
        let prog_ref = Program::new(built.id.clone(), built.image, false);
        if mod_opts.pin {
            if let Err(err) = prog_ref
                .program()
                .ensure_storage(self.inner.storage.as_ref())
                .await
            {
                prog_ref.unref();
                return Err(err);
            }
        }

        let id = built.id;
        let prog = {
            let mut state = self.inner.state.lock().await;
            if let Err(err) = state.check_open() {
                prog_ref.unref();
                return Err(err);
            }
            let (prog, _) = state.merge_program_ref(prog_ref);
            if mod_opts.pin {
                if let Some(pri) = &ctx.principal {
                    state.account_mut(&pri.clone()).ensure_program_ref(&prog, &mod_opts.tags);
                }
            }
            prog
        };

        let info = self.launch(ctx, prog, &launch, &inst_policy, true).await?;
        Ok((id, info))
    }

    /// Fetch a module from a source URI and launch an instance of it.
    pub async fn source_module_instance(
        &self,
        ctx: &mut OpContext,
        uri: &str,
        mod_opts: ModuleOptions,
        launch: LaunchOptions,
    ) -> Result<(ModuleId, InstanceInfo)> {
        self.next_request_id(ctx);
        let result = self
            .source_module_instance_inner(ctx, uri, &mod_opts, launch)
            .await;
        self.finish(ctx, result)
    }

    async fn source_module_instance_inner(
        &self,
        ctx: &mut OpContext,
        uri: &str,
        mod_opts: &ModuleOptions,
        launch: LaunchOptions,
    ) -> Result<(ModuleId, InstanceInfo)> {
        let mut inst_policy = self.instance_policy();
        {
            let mut prog_policy = self.program_policy();
            self.inner
                .authorizer
                .authorize_program_source(ctx, &mut prog_policy, Some(&mut inst_policy), uri)
                .await?;
        }
        let id = self.source_module_inner(ctx, uri, mod_opts).await?;
        let prog_ref = self.ref_program(&id).await?;
        let result = self
            .launch(ctx, prog_ref.program().clone(), &launch, &inst_policy, false)
            .await;
        prog_ref.unref();
        Ok((id, result?))
    }

    /// Launch skeleton shared by every instance-creating path: validate
    /// options, allocate handles, install the instance in its owner set
    /// with two extra program references, then start or annihilate.
    async fn launch(
        &self,
        ctx: &OpContext,
        prog: Arc<Program>,
        launch: &LaunchOptions,
        inst_policy: &InstancePolicy,
        streamed: bool,
    ) -> Result<InstanceInfo> {
        if launch.scope.len() > MAX_SCOPE {
            return Err(Error::ScopeTooLarge);
        }
        if launch.suspend && !launch.function.is_empty() {
            return Err(Error::instance_status(
                "entry function cannot be set on a suspended launch",
            ));
        }
        let id = launch.instance.clone().unwrap_or_default();

        let prog_image = prog.image()?;
        let entry_addr = prog_image.resolve_entry(&launch.function)?;
        let inst_image = prog_image.new_instance(entry_addr);

        let (process, services) = if launch.suspend || inst_image.is_final() {
            (None, None)
        } else {
            (
                Some(self.inner.process_factory.new_process().await?),
                Some(self.inner.service_factory.new_services()),
            )
        };
        let debug_log = self.open_debug_log(&launch.invoke.debug_log);

        let inst = Instance::new(
            id.clone(),
            ctx.principal.clone(),
            prog.id.clone(),
            inst_image,
            process,
            services,
            launch.transient,
            launch.tags.clone(),
            inst_policy.time_resolution,
            debug_log,
        );

        // Install under the lock with two extra references: one owned by
        // the record, one handed to the driver.
        let driver_ref = {
            let mut state = self.inner.state.lock().await;
            state.check_open()?;
            let record = AccountInstance::new(inst.clone(), prog.add_ref());
            match &ctx.principal {
                Some(pri) => {
                    let account = state.account_mut(pri);
                    if let Err(err) = account.check_unique_instance_id(&id) {
                        record.release();
                        return Err(err);
                    }
                    account.install_instance(id.clone(), record);
                }
                None => {
                    if state.anonymous.contains_key(&id) {
                        record.release();
                        return Err(Error::InstanceIdExists);
                    }
                    state.anonymous.insert(id.clone(), record);
                }
            }
            prog.add_ref()
        };

        let text = inst.active_text(&prog_image).await;
        match inst.start_or_annihilate(text).await {
            Ok(drive) => {
                if let Err(err) = inst.store(self.inner.storage.as_ref()).await {
                    self.emit(Event::fail_internal(ctx.meta(), "image storage", &err));
                }
                if drive {
                    self.spawn_driver(inst.clone(), driver_ref, ctx.meta());
                } else {
                    driver_ref.unref();
                }
            }
            Err(err) => {
                driver_ref.unref();
                let mut state = self.inner.state.lock().await;
                Self::remove_instance_locked(&mut state, &ctx.principal, &id);
                return Err(err);
            }
        }

        let typ = if streamed {
            EventType::InstanceCreateStream
        } else {
            EventType::InstanceCreateKnown
        };
        let mut record = InstanceRecord::new(id.clone());
        record.module = Some(prog.id.clone());
        record.transient = launch.transient;
        self.emit(Event::new(typ, ctx.meta()).with_instance(record));

        inst.info().await.ok_or_else(|| {
            Error::internal("instance vanished after start")
        })
    }

    fn remove_instance_locked(
        state: &mut ServerState,
        principal: &Option<PrincipalId>,
        id: &InstanceId,
    ) {
        let record = match principal {
            Some(pri) => state
                .accounts
                .get_mut(pri)
                .and_then(|account| account.remove_instance(id)),
            None => state.anonymous.remove(id),
        };
        if let Some(record) = record {
            record.release();
        }
    }

    // ========================================================================
    // Instance operations
    // ========================================================================

    /// Non-secret metadata of one instance.
    pub async fn instance_info(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<InstanceInfo> {
        self.next_request_id(ctx);
        let result = self.instance_info_inner(ctx, id).await;
        self.finish(ctx, result)
    }

    async fn instance_info_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
    ) -> Result<InstanceInfo> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;
        let info = inst.info().await.ok_or(Error::InstanceNotFound)?;
        self.emit(
            Event::new(EventType::InstanceInfo, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        Ok(info)
    }

    /// All instances owned by the calling principal. The listing is built
    /// in two phases so the server lock is not held across instance locks.
    pub async fn instances(&self, ctx: &mut OpContext) -> Result<Vec<InstanceInfo>> {
        self.next_request_id(ctx);
        let result = self.instances_inner(ctx).await;
        self.finish(ctx, result)
    }

    async fn instances_inner(&self, ctx: &mut OpContext) -> Result<Vec<InstanceInfo>> {
        self.inner.authorizer.authorize(ctx).await?;
        let pri = ctx
            .principal
            .clone()
            .ok_or_else(|| Error::unauthenticated("instance listing requires a principal"))?;

        let insts: Vec<Arc<Instance>> = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            state
                .accounts
                .get(&pri)
                .map(|account| account.instances().cloned().collect())
                .unwrap_or_default()
        };
        let mut infos = Vec::with_capacity(insts.len());
        for inst in insts {
            if let Some(info) = inst.info().await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.instance.cmp(&b.instance));
        self.emit(Event::new(EventType::InstanceList, ctx.meta()));
        Ok(infos)
    }

    /// Block until the instance stops or the token is cancelled; returns
    /// the status at that point.
    pub async fn wait_instance(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        cancel: &CancellationToken,
    ) -> Result<Status> {
        self.next_request_id(ctx);
        let result = self.wait_instance_inner(ctx, id, cancel).await;
        self.finish(ctx, result)
    }

    async fn wait_instance_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        cancel: &CancellationToken,
    ) -> Result<Status> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;
        let status = inst.wait(cancel).await;
        let mut record = InstanceRecord::new(id.clone());
        record.status = Some(status.clone());
        self.emit(Event::new(EventType::InstanceWait, ctx.meta()).with_instance(record));
        Ok(status)
    }

    /// Signal the instance's process to terminate.
    pub async fn kill_instance(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.next_request_id(ctx);
        let result = self.kill_instance_inner(ctx, id).await;
        self.finish(ctx, result)
    }

    async fn kill_instance_inner(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;
        inst.kill().await;
        self.emit(
            Event::new(EventType::InstanceKill, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        Ok(())
    }

    /// Signal the instance's process to suspend. The program is persisted
    /// first so a suspended instance always has a stored module to resume
    /// from; the instance also stops being transient.
    pub async fn suspend_instance(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.next_request_id(ctx);
        let result = self.suspend_instance_inner(ctx, id).await;
        self.finish(ctx, result)
    }

    async fn suspend_instance_inner(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;

        let prog_ref = self.ref_program(&inst.module).await?;
        let stored = prog_ref
            .program()
            .ensure_storage(self.inner.storage.as_ref())
            .await;
        prog_ref.unref();
        stored?;

        inst.suspend(true).await;
        self.emit(
            Event::new(EventType::InstanceSuspend, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        Ok(())
    }

    /// Resume a suspended or halted instance with a fresh process.
    pub async fn resume_instance(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        opts: ResumeOptions,
    ) -> Result<InstanceInfo> {
        self.next_request_id(ctx);
        let result = self.resume_instance_inner(ctx, id, &opts).await;
        self.finish(ctx, result)
    }

    async fn resume_instance_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        opts: &ResumeOptions,
    ) -> Result<InstanceInfo> {
        let mut inst_policy = self.instance_policy();
        self.inner
            .authorizer
            .authorize_instance(ctx, &mut inst_policy)
            .await?;

        let inst = self.get_instance(ctx, id).await?;
        inst.check_resume(&opts.function).await?;

        let prog_ref = self.ref_program(&inst.module).await?;
        let result = self
            .resume_with_program(ctx, &inst, prog_ref.program(), opts, &inst_policy)
            .await;
        match result {
            Ok(info) => {
                prog_ref.unref();
                Ok(info)
            }
            Err(err) => {
                prog_ref.unref();
                Err(err)
            }
        }
    }

    async fn resume_with_program(
        &self,
        ctx: &OpContext,
        inst: &Arc<Instance>,
        prog: &Arc<Program>,
        opts: &ResumeOptions,
        inst_policy: &InstancePolicy,
    ) -> Result<InstanceInfo> {
        let prog_image = prog.image()?;
        let entry_addr = if opts.function.is_empty() {
            None
        } else {
            Some(prog_image.resolve_entry(&opts.function)?)
        };

        let process = self.inner.process_factory.new_process().await?;
        let services = self.inner.service_factory.new_services();
        let debug_log = self.open_debug_log(&opts.invoke.debug_log);

        inst.resume(
            &opts.function,
            entry_addr,
            process,
            services,
            inst_policy.time_resolution,
            debug_log,
        )
        .await?;

        let driver_ref = {
            let state = self.inner.state.lock().await;
            state.check_open()?;
            prog.add_ref()
        };
        let text = inst.active_text(&prog_image).await;
        match inst.start_or_annihilate(text).await {
            Ok(true) => self.spawn_driver(inst.clone(), driver_ref, ctx.meta()),
            Ok(false) => driver_ref.unref(),
            Err(err) => {
                driver_ref.unref();
                return Err(err);
            }
        }

        self.emit(
            Event::new(EventType::InstanceResume, ctx.meta())
                .with_instance(InstanceRecord::new(inst.id.clone())),
        );
        inst.info()
            .await
            .ok_or_else(|| Error::internal("instance vanished after resume"))
    }

    /// Delete a stopped instance, removing its stored image.
    pub async fn delete_instance(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.next_request_id(ctx);
        let result = self.delete_instance_inner(ctx, id).await;
        self.finish(ctx, result)
    }

    async fn delete_instance_inner(&self, ctx: &mut OpContext, id: &InstanceId) -> Result<()> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;
        inst.annihilate(self.inner.storage.as_ref()).await?;
        {
            let mut state = self.inner.state.lock().await;
            Self::remove_instance_locked(&mut state, &ctx.principal, id);
        }
        self.emit(
            Event::new(EventType::InstanceDelete, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        Ok(())
    }

    /// Produce a new program from a stopped instance's state. A running
    /// instance is suspended for the duration and resumed afterwards.
    pub async fn snapshot(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        opts: ModuleOptions,
    ) -> Result<ModuleId> {
        self.next_request_id(ctx);
        let result = self.snapshot_inner(ctx, id, &opts).await;
        self.finish(ctx, result)
    }

    async fn snapshot_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        opts: &ModuleOptions,
    ) -> Result<ModuleId> {
        let mut policy = self.program_policy();
        self.inner.authorizer.authorize_program(ctx, &mut policy).await?;
        if opts.pin && ctx.principal.is_none() {
            return Err(Error::unauthenticated("anonymous caller cannot pin modules"));
        }

        let inst = self.get_instance(ctx, id).await?;

        // Suspend a running instance around the snapshot.
        let was_running = inst.status().await.state == State::Running;
        if was_running {
            self.suspend_instance_inner(ctx, id).await?;
            let cancel = CancellationToken::new();
            let status = inst.wait(&cancel).await;
            if status.state != State::Suspended {
                return Err(Error::instance_status("instance did not suspend"));
            }
        }

        let result = self.snapshot_stopped(ctx, &inst, opts).await;

        if was_running && result.is_ok() {
            let resume = ResumeOptions::default();
            let inst_policy = self.instance_policy();
            let prog_ref = self.ref_program(&inst.module).await?;
            let resumed = self
                .resume_with_program(ctx, &inst, prog_ref.program(), &resume, &inst_policy)
                .await;
            prog_ref.unref();
            if let Err(err) = resumed {
                self.emit(Event::fail_internal(ctx.meta(), "snapshot resume", &err));
            }
        }
        result
    }

    async fn snapshot_stopped(
        &self,
        ctx: &OpContext,
        inst: &Arc<Instance>,
        opts: &ModuleOptions,
    ) -> Result<ModuleId> {
        let prog_ref = self.ref_program(&inst.module).await?;
        let outcome = async {
            prog_ref
                .program()
                .ensure_storage(self.inner.storage.as_ref())
                .await?;
            let prog_image = prog_ref.program().image()?;
            let loader = self.inner.loader.clone();
            let module = inst
                .with_stopped_image(|image| loader.snapshot(&prog_image, image))
                .await?;
            let new_id = hash_module_bytes(&module);
            let built = build_known_program(
                self.inner.loader.as_ref(),
                &self.inner.config.limits,
                &new_id,
                module,
                false,
            )?;
            Ok::<_, Error>(Program::new(built.id, built.image, false))
        }
        .await;
        prog_ref.unref();
        let new_ref = outcome?;

        if let Err(err) = new_ref
            .program()
            .ensure_storage(self.inner.storage.as_ref())
            .await
        {
            new_ref.unref();
            return Err(err);
        }
        let new_id = new_ref.id().clone();
        {
            let mut state = self.inner.state.lock().await;
            if let Err(err) = state.check_open() {
                new_ref.unref();
                return Err(err);
            }
            let (prog, _) = state.merge_program_ref(new_ref);
            if opts.pin {
                if let Some(pri) = &ctx.principal {
                    state.account_mut(&pri.clone()).ensure_program_ref(&prog, &opts.tags);
                }
            }
        }
        let mut record = InstanceRecord::new(inst.id.clone());
        record.module = Some(new_id.clone());
        self.emit(Event::new(EventType::InstanceSnapshot, ctx.meta()).with_instance(record));
        Ok(new_id)
    }

    /// Update instance metadata. Only emits an event when something
    /// actually changed.
    pub async fn update_instance(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        mut update: InstanceUpdate,
    ) -> Result<InstanceInfo> {
        self.next_request_id(ctx);
        let result = self.update_instance_inner(ctx, id, &mut update).await;
        self.finish(ctx, result)
    }

    async fn update_instance_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        update: &mut InstanceUpdate,
    ) -> Result<InstanceInfo> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;
        let changed = inst.update(update).await?;
        if changed {
            if update.persist {
                if let Err(err) = inst.store(self.inner.storage.as_ref()).await {
                    self.emit(Event::fail_internal(ctx.meta(), "image storage", &err));
                }
            }
            let mut record = InstanceRecord::new(id.clone());
            record.tag_count = (!update.tags.is_empty()).then_some(update.tags.len());
            self.emit(Event::new(EventType::InstanceUpdate, ctx.meta()).with_instance(record));
        }
        inst.info()
            .await
            .ok_or(Error::InstanceNotFound)
    }

    /// Debug operation over an instance's breakpoint set. Divergent sets
    /// trigger a program rebuild outside the instance lock; an in-flight
    /// change of the set fails the operation with a conflict.
    pub async fn debug_instance(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        req: DebugRequest,
    ) -> Result<DebugResponse> {
        self.next_request_id(ctx);
        let result = self.debug_instance_inner(ctx, id, &req).await;
        self.finish(ctx, result)
    }

    async fn debug_instance_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        req: &DebugRequest,
    ) -> Result<DebugResponse> {
        let mut inst_policy = self.instance_policy();
        self.inner
            .authorizer
            .authorize_instance(ctx, &mut inst_policy)
            .await?;

        let inst = self.get_instance(ctx, id).await?;
        let prog_ref = self.ref_program(&inst.module).await?;
        let result = self
            .debug_with_program(&inst, prog_ref.program(), req, inst_policy.max_breakpoints)
            .await;
        prog_ref.unref();
        let resp = result?;
        self.emit(
            Event::new(EventType::InstanceDebug, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        Ok(resp)
    }

    async fn debug_with_program(
        &self,
        inst: &Arc<Instance>,
        prog: &Arc<Program>,
        req: &DebugRequest,
        max_breakpoints: usize,
    ) -> Result<DebugResponse> {
        let prog_image = prog.image()?;
        match inst.debug_plan(req, &prog_image, max_breakpoints).await? {
            DebugPhase::Done(resp) => Ok(resp),
            DebugPhase::Rebuild { observed, new } => {
                let alt = rebuild_program_image(
                    self.inner.loader.as_ref(),
                    &self.inner.config.limits,
                    prog.module_bytes()?,
                    &new,
                )?;
                inst.debug_apply(observed, new, alt).await
            }
        }
    }

    /// Connect a caller's stream pair to a running instance. Returns
    /// `InstanceNoConnect` if the instance has already stopped.
    pub async fn instance_connect(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        cancel: CancellationToken,
        input: Pin<Box<dyn AsyncRead + Send>>,
        output: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Result<()> {
        self.next_request_id(ctx);
        let result = self
            .instance_connect_inner(ctx, id, cancel, input, output)
            .await;
        self.finish(ctx, result)
    }

    async fn instance_connect_inner(
        &self,
        ctx: &mut OpContext,
        id: &InstanceId,
        cancel: CancellationToken,
        input: Pin<Box<dyn AsyncRead + Send>>,
        output: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Result<()> {
        self.inner.authorizer.authorize(ctx).await?;
        let inst = self.get_instance(ctx, id).await?;

        self.emit(
            Event::new(EventType::InstanceConnect, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        let result = inst.connect(cancel, input, output).await;
        self.emit(
            Event::new(EventType::InstanceDisconnect, ctx.meta())
                .with_instance(InstanceRecord::new(id.clone())),
        );
        match result? {
            true => Ok(()),
            false => Err(Error::InstanceNoConnect),
        }
    }

    // ========================================================================
    // Driver loop
    // ========================================================================

    fn spawn_driver(&self, inst: Arc<Instance>, prog_ref: ProgramRef, meta: Meta) {
        let server = self.clone();
        tokio::spawn(async move {
            server.drive(inst, prog_ref, meta).await;
        });
    }

    /// Serve the instance's process to completion and install the final
    /// status. Runs exactly once per (instance, active process).
    async fn drive(&self, inst: Arc<Instance>, prog_ref: ProgramRef, meta: Meta) {
        let handles = match inst.checkout_for_serve().await {
            Ok(handles) => handles,
            Err(err) => {
                self.emit(Event::fail_internal(meta, "driver", &err));
                prog_ref.unref();
                return;
            }
        };
        let transient_at_start = handles.transient;

        let served = handles
            .process
            .serve(handles.services.clone(), handles.image, handles.buffers)
            .await;

        let (status, annihilate) = match served {
            Ok(mut serve) => {
                serve.image.set_trap(serve.trap);
                serve.image.set_result(serve.result);

                let mut status = match serve.trap {
                    Trap::Exit => final_status(Trap::Exit, serve.result, transient_at_start),
                    Trap::AbiViolation => {
                        self.emit(Event::fail_request(meta.clone(), FailKind::ProgramError));
                        final_status(Trap::AbiViolation, serve.result, transient_at_start)
                    }
                    trap => final_status(trap, serve.result, transient_at_start),
                };

                let mut image_ok = true;
                if serve.trap != Trap::Killed {
                    if let Err(err) = serve.image.check_mutation() {
                        self.emit(Event::fail_internal(meta.clone(), "driver", &err));
                        status = internal_kill_status(&err);
                        image_ok = false;
                    }
                }

                let transient = inst
                    .complete_serve(serve.image, serve.buffers, status.state.is_final())
                    .await;
                if image_ok && !transient {
                    if let Err(err) = inst.store(self.inner.storage.as_ref()).await {
                        self.emit(Event::fail_internal(meta.clone(), "image storage", &err));
                    }
                }
                (status, transient)
            }
            Err(err) => {
                self.emit(Event::fail_internal(meta.clone(), "service io", &err));
                inst.abort_serve().await;
                (internal_kill_status(&err), transient_at_start)
            }
        };

        let mut record = InstanceRecord::new(inst.id.clone());
        record.status = Some(status.clone());
        self.emit(Event::new(EventType::InstanceStop, meta.clone()).with_instance(record));

        // Transient instances are deleted whenever they stop; suspend
        // protects itself by clearing the flag first. The final status is
        // published only after storage, events and deletion, so a waiter
        // observing it sees all of them.
        if annihilate {
            if let Err(err) = inst.annihilate_unpublished(self.inner.storage.as_ref()).await {
                self.emit(Event::fail_internal(meta.clone(), "driver", &err));
            } else {
                let mut state = self.inner.state.lock().await;
                Self::remove_instance_locked(&mut state, &inst.principal, &inst.id);
                drop(state);
                self.emit(
                    Event::new(EventType::InstanceDelete, meta)
                        .with_instance(InstanceRecord::new(inst.id.clone())),
                );
            }
        }

        inst.publish_stop(status).await;
        prog_ref.unref();
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Detach all state, suspend every owned instance, kill every anonymous
    /// one, and wait for the drain. The drain ends at the configured
    /// timeout or when the caller's token is cancelled, whichever comes
    /// first. Returns an error if any instance was still Running then.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        let drain_timeout = self.inner.config.shutdown.drain_timeout;

        let (accounts, anonymous, programs) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let accounts = std::mem::take(&mut state.accounts);
            let anonymous = std::mem::take(&mut state.anonymous);
            let programs = std::mem::take(&mut state.programs);
            (accounts, anonymous, programs)
        };

        // Drop the map's count units.
        for (_, prog) in programs {
            ProgramRef::from_program(prog).unref();
        }

        let mut records = Vec::new();
        for (_, mut account) in accounts {
            for (_, record) in account.shutdown() {
                record.inst.suspend(true).await;
                records.push(record);
            }
        }
        for (_, record) in anonymous {
            record.inst.kill().await;
            records.push(record);
        }

        let deadline = cancel.child_token();
        let timer_token = deadline.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(drain_timeout).await;
            timer_token.cancel();
        });

        let statuses =
            futures::future::join_all(records.iter().map(|record| record.inst.wait(&deadline)))
                .await;
        let still_running = statuses
            .iter()
            .filter(|status| status.state == State::Running)
            .count();
        for record in records {
            record.release();
        }
        timer.abort();

        info!(still_running, "server_shutdown_complete");
        if still_running > 0 {
            return Err(Error::unavailable(format!(
                "{still_running} instances still running at shutdown deadline"
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn program_map_len(&self) -> usize {
        self.inner.state.lock().await.programs.len()
    }

    #[cfg(test)]
    pub(crate) async fn program_ref_count(&self, id: &ModuleId) -> Option<usize> {
        self.inner
            .state
            .lock()
            .await
            .programs
            .get(id)
            .map(|prog| prog.ref_count())
    }
}

fn internal_kill_status(err: &Error) -> Status {
    Status {
        state: State::Killed,
        cause: crate::api::Cause::Internal,
        result: 0,
        error: Some(err.to_string()),
    }
}
