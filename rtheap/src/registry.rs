//! # Region Registry
//!
//! Owns the well-known regions and sequences the memory devices in and out.
//!
//! ## Regions
//! - **System**: the nucleus heap. Exists from construction; user space may
//!   only query its statistics.
//! - **Shared**: one heap mapped by every process, carrying the shared info
//!   page.
//! - **Private**: one heap per attached process.
//!
//! ## Startup
//! `start()` runs five steps in order. The first failure undoes the steps
//! already completed, newest first, and nothing stays registered.
//!
//! 1. create the shared region
//! 2. carve and fill the shared info page
//! 3. register the private endpoint
//! 4. register the shared endpoint
//! 5. register the system endpoint
//!
//! The info page is published only once step 5 has succeeded. `shutdown()`
//! walks the same steps backwards.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::mem::size_of;

use crate::config::MemConfig;
use crate::error::MemError;
use crate::info_page::{InfoRecord, SharedInfoPage};
use crate::mapping::{self, Mapping, VmArea};
use crate::region::{
    BuddyHeap, Heap, HostMemory, MemoryRegion, RegionCaps, RegionStat, ReleaseFn,
};

/// Addressable memory endpoints, by minor number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    /// The caller's own private heap
    Private = 0,
    /// The system-wide shared heap
    Shared = 1,
    /// The nucleus heap, statistics only
    System = 2,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Private, Endpoint::Shared, Endpoint::System];

    pub fn minor(self) -> u32 {
        self as u32
    }

    pub fn from_minor(minor: u32) -> Option<Self> {
        match minor {
            0 => Some(Endpoint::Private),
            1 => Some(Endpoint::Shared),
            2 => Some(Endpoint::System),
            _ => None,
        }
    }

    /// Device name the endpoint is registered under
    pub fn label(self) -> &'static str {
        match self {
            Endpoint::Private => "memdev-private",
            Endpoint::Shared => "memdev-shared",
            Endpoint::System => "memdev-sys",
        }
    }
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Device glue the endpoints are published through
pub trait EndpointRegistrar: Send + Sync {
    fn register(&self, endpoint: Endpoint) -> Result<(), MemError>;

    fn unregister(&self, endpoint: Endpoint);
}

/// Startup steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StartupStage {
    SharedRegion,
    InfoPage,
    PrivateEndpoint,
    SharedEndpoint,
    SystemEndpoint,
}

impl StartupStage {
    pub const SEQUENCE: [StartupStage; 5] = [
        StartupStage::SharedRegion,
        StartupStage::InfoPage,
        StartupStage::PrivateEndpoint,
        StartupStage::SharedEndpoint,
        StartupStage::SystemEndpoint,
    ];

    /// The step completed before this one
    pub fn previous(self) -> Option<Self> {
        match self {
            StartupStage::SharedRegion => None,
            StartupStage::InfoPage => Some(StartupStage::SharedRegion),
            StartupStage::PrivateEndpoint => Some(StartupStage::InfoPage),
            StartupStage::SharedEndpoint => Some(StartupStage::PrivateEndpoint),
            StartupStage::SystemEndpoint => Some(StartupStage::SharedEndpoint),
        }
    }

    /// The endpoint this step registers, if any
    pub fn endpoint(self) -> Option<Endpoint> {
        match self {
            StartupStage::PrivateEndpoint => Some(Endpoint::Private),
            StartupStage::SharedEndpoint => Some(Endpoint::Shared),
            StartupStage::SystemEndpoint => Some(Endpoint::System),
            _ => None,
        }
    }

    fn of(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::Private => StartupStage::PrivateEndpoint,
            Endpoint::Shared => StartupStage::SharedEndpoint,
            Endpoint::System => StartupStage::SystemEndpoint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

bitflags::bitflags! {
    /// Access mode a session is opened with
    pub struct OpenFlags: u32 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// An open endpoint, as seen by the device glue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    endpoint: Endpoint,
    process: Option<ProcessId>,
    flags: OpenFlags,
}

impl Session {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The process that opened the session, if any
    pub fn process(&self) -> Option<ProcessId> {
        self.process
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }
}

/// Process-wide owner of the memory regions
pub struct RegionRegistry<H: Heap = BuddyHeap> {
    config: MemConfig,
    host: Arc<dyn HostMemory>,
    registrar: Box<dyn EndpointRegistrar>,
    system: Arc<MemoryRegion<H>>,
    shared: Option<Arc<MemoryRegion<H>>>,
    private: spin::Mutex<BTreeMap<ProcessId, Arc<MemoryRegion<H>>>>,
    /// Filled by step 2, visible to readers only through `published`
    info: Option<SharedInfoPage>,
    published: spin::Once<SharedInfoPage>,
    /// Last completed startup step
    stage: Option<StartupStage>,
}

impl<H: Heap> RegionRegistry<H> {
    /// Build the registry and the system region
    ///
    /// # Arguments
    ///
    /// * `config` - Heap sizes and published features
    /// * `host` - Page provider for every region
    /// * `registrar` - Device glue the endpoints are published through
    ///
    /// # Returns
    ///
    /// * `Err(MemError::InvalidArgument)` - A configured size is zero
    /// * `Err(MemError::OutOfMemory)` - The system heap could not be created
    pub fn new(
        config: MemConfig,
        host: Arc<dyn HostMemory>,
        registrar: Box<dyn EndpointRegistrar>,
    ) -> Result<Self, MemError> {
        config.validate()?;

        let system = MemoryRegion::create(
            host.clone(),
            "system heap",
            config.system_heap_size,
            RegionCaps::stats_only(),
            None,
        )?;

        Ok(Self {
            config,
            host,
            registrar,
            system: Arc::new(system),
            shared: None,
            private: spin::Mutex::new(BTreeMap::new()),
            info: None,
            published: spin::Once::new(),
            stage: None,
        })
    }

    /// Run the startup sequence
    ///
    /// On failure every completed step has been undone and the registry is
    /// back where it was before the call.
    pub fn start(&mut self) -> Result<(), MemError> {
        if self.stage.is_some() {
            return Err(MemError::InvalidArgument);
        }

        for stage in StartupStage::SEQUENCE {
            if let Err(err) = self.run(stage) {
                log::error!("memdev: startup failed at {:?}: {}", stage, err);
                self.unwind();
                return Err(err);
            }
            self.stage = Some(stage);
        }

        if let Some(info) = self.info {
            self.published.call_once(|| info);
        }
        log::info!(
            "memdev: started, shared heap {} KiB, system heap {} KiB",
            self.config.shared_heap_size / 1024,
            self.config.system_heap_size / 1024
        );
        Ok(())
    }

    /// Undo every completed startup step, newest first
    ///
    /// Does nothing when startup never ran. Views still mapping the shared
    /// region keep it alive until they close.
    pub fn shutdown(&mut self) {
        if self.stage.is_none() {
            return;
        }
        self.published = spin::Once::new();
        self.unwind();
        log::info!("memdev: stopped");
    }

    fn run(&mut self, stage: StartupStage) -> Result<(), MemError> {
        match stage {
            StartupStage::SharedRegion => {
                let shared = MemoryRegion::create(
                    self.host.clone(),
                    "shared heap",
                    self.config.shared_heap_size,
                    RegionCaps::mappable(),
                    None,
                )?;
                self.shared = Some(Arc::new(shared));
            }
            StartupStage::InfoPage => {
                let shared = self.shared.as_ref().ok_or(MemError::NoSuchDevice)?;
                let ptr = shared
                    .allocate(size_of::<InfoRecord>())
                    .map_err(|_| MemError::OutOfMemory)?;
                let base = shared.base_address().ok_or(MemError::NoSuchDevice)?;
                // SAFETY: fresh allocation from the shared heap, which lives
                // until the page is freed in `undo`
                self.info = Some(unsafe { SharedInfoPage::populate(ptr, base, self.config.features) });
            }
            StartupStage::PrivateEndpoint
            | StartupStage::SharedEndpoint
            | StartupStage::SystemEndpoint => {
                if let Some(endpoint) = stage.endpoint() {
                    self.registrar.register(endpoint)?;
                    log::debug!("memdev: {} registered", endpoint);
                }
            }
        }
        Ok(())
    }

    fn unwind(&mut self) {
        while let Some(stage) = self.stage {
            self.undo(stage);
            self.stage = stage.previous();
        }
    }

    fn undo(&mut self, stage: StartupStage) {
        match stage {
            StartupStage::SharedRegion => {
                if let Some(shared) = self.shared.take() {
                    shared.release_reference();
                }
            }
            StartupStage::InfoPage => {
                if let (Some(info), Some(shared)) = (self.info.take(), self.shared.as_ref()) {
                    // SAFETY: the page came from this heap and is no longer
                    // published
                    if let Err(err) = unsafe { shared.free(info.as_ptr()) } {
                        log::warn!("memdev: info page release failed: {}", err);
                    }
                }
            }
            StartupStage::PrivateEndpoint
            | StartupStage::SharedEndpoint
            | StartupStage::SystemEndpoint => {
                if let Some(endpoint) = stage.endpoint() {
                    self.registrar.unregister(endpoint);
                    log::debug!("memdev: {} unregistered", endpoint);
                }
            }
        }
    }

    fn is_registered(&self, endpoint: Endpoint) -> bool {
        self.stage.map_or(false, |s| s >= StartupStage::of(endpoint))
    }

    /// Open `endpoint` on behalf of `process`
    ///
    /// The system endpoint is read-only.
    pub fn open_session(
        &self,
        endpoint: Endpoint,
        process: Option<ProcessId>,
        flags: OpenFlags,
    ) -> Result<Session, MemError> {
        if !self.is_registered(endpoint) {
            return Err(MemError::NoSuchDevice);
        }
        if endpoint == Endpoint::System && flags.contains(OpenFlags::WRITE) {
            return Err(MemError::PermissionDenied);
        }
        Ok(Session {
            endpoint,
            process,
            flags,
        })
    }

    /// The region a session addresses
    pub fn resolve(&self, session: &Session) -> Result<Arc<MemoryRegion<H>>, MemError> {
        match session.endpoint {
            Endpoint::Private => {
                let pid = session.process.ok_or(MemError::NoSuchDevice)?;
                self.private_region(pid).ok_or(MemError::NoSuchDevice)
            }
            Endpoint::Shared => self.shared.clone().ok_or(MemError::NoSuchDevice),
            Endpoint::System => Ok(self.system.clone()),
        }
    }

    /// Map the session's region into `vma`
    pub fn open_mapping(&self, session: &Session, vma: &mut VmArea) -> Result<Mapping<H>, MemError> {
        let region = self.resolve(session)?;
        Mapping::open(&region, vma)
    }

    /// Serve a control request on the session's region
    pub fn control(&self, session: &Session, code: u32) -> Result<RegionStat, MemError> {
        let region = self.resolve(session)?;
        mapping::control(&region, code)
    }

    /// Placement hint for the session's region on hosts without an MMU
    pub fn unmapped_area(&self, session: &Session, pgoff: usize) -> Result<usize, MemError> {
        let region = self.resolve(session)?;
        mapping::unmapped_area(&region, pgoff)
    }

    /// Give `pid` its private region
    ///
    /// `release` runs once the region is finally destroyed, which may be
    /// after `detach_process` if views are still open.
    ///
    /// # Returns
    ///
    /// * `Err(MemError::InvalidArgument)` - The process is already attached
    /// * `Err(MemError::OutOfMemory)` - The region could not be created
    pub fn attach_process(
        &self,
        pid: ProcessId,
        release: Option<ReleaseFn>,
    ) -> Result<Arc<MemoryRegion<H>>, MemError> {
        if self.private.lock().contains_key(&pid) {
            return Err(MemError::InvalidArgument);
        }

        // created outside the map lock, the host may block
        let region = Arc::new(MemoryRegion::create(
            self.host.clone(),
            "private heap",
            self.config.private_heap_size,
            RegionCaps::mappable(),
            release,
        )?);

        let mut private = self.private.lock();
        if private.contains_key(&pid) {
            drop(private);
            region.release_reference();
            return Err(MemError::InvalidArgument);
        }
        private.insert(pid, region.clone());
        log::debug!("memdev: process {} attached", pid.0);
        Ok(region)
    }

    pub fn create_private_region(&self, pid: ProcessId) -> Result<Arc<MemoryRegion<H>>, MemError> {
        self.attach_process(pid, None)
    }

    /// Drop the registry's hold on `pid`'s private region
    ///
    /// Returns whether the region was destroyed right away.
    pub fn detach_process(&self, pid: ProcessId) -> Result<bool, MemError> {
        let region = self.private.lock().remove(&pid).ok_or(MemError::NoSuchDevice)?;
        log::debug!("memdev: process {} detached", pid.0);
        Ok(region.release_reference())
    }

    /// Drop the registry's hold on a private region
    ///
    /// Only private regions can be destroyed this way; the shared and system
    /// regions follow the registry lifecycle.
    pub fn destroy_region(&self, region: &Arc<MemoryRegion<H>>) -> Result<bool, MemError> {
        let pid = self
            .private
            .lock()
            .iter()
            .find(|(_, r)| Arc::ptr_eq(r, region))
            .map(|(pid, _)| *pid)
            .ok_or(MemError::InvalidArgument)?;
        self.detach_process(pid)
    }

    pub fn private_region(&self, pid: ProcessId) -> Option<Arc<MemoryRegion<H>>> {
        self.private.lock().get(&pid).cloned()
    }

    pub fn attached_processes(&self) -> usize {
        self.private.lock().len()
    }

    pub fn shared_region(&self) -> Option<&Arc<MemoryRegion<H>>> {
        self.shared.as_ref()
    }

    pub fn system_region(&self) -> &Arc<MemoryRegion<H>> {
        &self.system
    }

    /// The shared info page, once startup has completed
    pub fn info_page(&self) -> Option<&SharedInfoPage> {
        self.published.get()
    }

    pub fn stage(&self) -> Option<StartupStage> {
        self.stage
    }

    pub fn is_started(&self) -> bool {
        self.stage == Some(StartupStage::SystemEndpoint)
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }
}

impl<H: Heap> Drop for RegionRegistry<H> {
    fn drop(&mut self) {
        self.shutdown();
        let private = core::mem::take(&mut *self.private.lock());
        for region in private.into_values() {
            region.release_reference();
        }
        self.system.release_reference();
    }
}
