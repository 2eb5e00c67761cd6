//! Runtime-facing handle API.
//!
//! A runtime creates one [`GCHandleManager`] at start-up. The manager owns the
//! [`HandleTableMap`] and a global [`GCHandleStore`]; further stores can be
//! created per owner (for example per application domain) and destroyed when
//! the owner goes away. Handles are created through a store and used through
//! the manager. A collector scans every store through
//! [`GCHandleManager::map`] and the passes in [`crate::object_handle::roots`].

use crate::object_handle::{dependent_extra_info, dependent_secondary};
use crate::object_handle::{roots, HandleType};
use crate::table::{HandleTableBucket, HandleTableMap, ObjectHandle};
use crate::util::options::Options;
use crate::util::ObjectReference;
use crate::vm::{ScanContext, VMBinding};
use std::marker::PhantomData;

/// The handles of one owner.
pub struct GCHandleStore<'m, VM: VMBinding> {
    bucket: &'m HandleTableBucket,
    _p: PhantomData<VM>,
}

impl<'m, VM: VMBinding> GCHandleStore<'m, VM> {
    fn new(bucket: &'m HandleTableBucket) -> Self {
        GCHandleStore {
            bucket,
            _p: PhantomData,
        }
    }

    /// Index of the store's bucket in the map.
    pub fn index(&self) -> u32 {
        self.bucket.index()
    }

    pub fn owner_index(&self) -> u32 {
        self.bucket.owner_index()
    }

    pub fn bucket(&self) -> &'m HandleTableBucket {
        self.bucket
    }

    pub fn contains_handle(&self, handle: ObjectHandle) -> bool {
        self.bucket.contains_handle(handle)
    }

    /// Create a handle in the calling thread's table. Returns `None` if the
    /// table is out of memory.
    pub fn create_handle_of_type(
        &self,
        object: Option<ObjectReference>,
        ty: HandleType,
    ) -> Option<ObjectHandle> {
        self.create_handle_with_extra_info(object, ty, 0)
    }

    pub fn create_handle_with_extra_info(
        &self,
        object: Option<ObjectReference>,
        ty: HandleType,
        extra_info: usize,
    ) -> Option<ObjectHandle> {
        debug_assert!(extra_info == 0 || ty.info().has_extra_info);
        self.bucket
            .table_for_current_thread::<VM>()
            .create_handle::<VM>(ty.as_u8(), object, extra_info)
    }

    /// Create a handle that keeps `secondary` alive for as long as `primary` is.
    pub fn create_dependent_handle(
        &self,
        primary: Option<ObjectReference>,
        secondary: Option<ObjectReference>,
    ) -> Option<ObjectHandle> {
        self.create_handle_with_extra_info(
            primary,
            HandleType::Dependent,
            dependent_extra_info(secondary),
        )
    }
}

/// The handle subsystem of a runtime.
pub struct GCHandleManager<VM: VMBinding> {
    options: Options,
    map: HandleTableMap,
    global_store_index: u32,
    _p: PhantomData<VM>,
}

impl<VM: VMBinding> GCHandleManager<VM> {
    /// Create the map and the global store. Returns `None` if the global
    /// store cannot be allocated.
    ///
    /// This attempts to initialize the built-in logger. A runtime that wants
    /// its own logger should set it up before calling this.
    pub fn new(options: Options) -> Option<Self> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("The handle manager initialized the logger."),
            Err(_) => debug!(
                "The handle manager failed to initialize the logger. Possibly a logger has been initialized by user."
            ),
        }
        let map = HandleTableMap::new(options.initial_map_size);
        let bucket = HandleTableBucket::new(
            HandleType::type_flags(),
            0,
            options.tables_per_bucket(),
        )?;
        let global_store_index = map.insert_bucket(bucket);
        info!(
            "Initialized handle manager ({:?}, {} tables per store)",
            options.gc_mode,
            options.tables_per_bucket()
        );
        Some(GCHandleManager {
            options,
            map,
            global_store_index,
            _p: PhantomData,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Every store, for the collector to scan.
    pub fn map(&self) -> &HandleTableMap {
        &self.map
    }

    /// The store created with the manager. Only `None` if its bucket was
    /// removed from the map behind the manager's back.
    pub fn global_handle_store(&self) -> Option<GCHandleStore<'_, VM>> {
        self.get_handle_store(self.global_store_index)
    }

    /// Create a store for `owner_index`. Returns `None` if out of memory.
    pub fn create_handle_store(&self, owner_index: u32) -> Option<GCHandleStore<'_, VM>> {
        let bucket = HandleTableBucket::new(
            HandleType::type_flags(),
            owner_index,
            self.options.tables_per_bucket(),
        )?;
        let index = self.map.insert_bucket(bucket);
        self.get_handle_store(index)
    }

    pub fn get_handle_store(&self, index: u32) -> Option<GCHandleStore<'_, VM>> {
        self.map.get_bucket(index).map(GCHandleStore::new)
    }

    /// Destroy a store and every handle in it. The global store is left alone.
    ///
    /// # Safety
    /// No other [`GCHandleStore`] for the same bucket, and no handle created
    /// through it, may be used after this call. No collector scan may be
    /// running.
    pub unsafe fn destroy_handle_store(&self, store: GCHandleStore<'_, VM>) {
        let index = store.index();
        debug_assert_ne!(
            index, self.global_store_index,
            "the global handle store cannot be destroyed"
        );
        if index == self.global_store_index {
            warn!("Refusing to destroy the global handle store");
            return;
        }
        drop(store);
        if self.map.remove_bucket(index).is_some() {
            debug!("Destroyed handle store {}", index);
        }
    }

    pub fn create_global_handle_of_type(
        &self,
        object: Option<ObjectReference>,
        ty: HandleType,
    ) -> Option<ObjectHandle> {
        self.global_handle_store()?.create_handle_of_type(object, ty)
    }

    /// A new strong handle to the referent of `handle`, in the same table.
    pub fn create_duplicate_handle(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        handle
            .table()
            .create_handle::<VM>(HandleType::Strong.as_u8(), handle.fetch(), 0)
    }

    pub fn destroy_handle_of_type(&self, handle: ObjectHandle, ty: HandleType) {
        handle.table().destroy_handle(ty.as_u8(), handle);
    }

    pub fn destroy_handle_of_unknown_type(&self, handle: ObjectHandle) {
        handle.table().destroy_handle_of_unknown_type(handle);
    }

    /// Returns false if `ty` carries no extra info.
    pub fn set_extra_info_for_handle(&self, handle: ObjectHandle, ty: HandleType, value: usize) -> bool {
        handle.set_extra_info(ty.as_u8(), value)
    }

    pub fn get_extra_info_from_handle(&self, handle: ObjectHandle) -> usize {
        handle.extra_info()
    }

    pub fn store_object_in_handle(&self, handle: ObjectHandle, object: Option<ObjectReference>) {
        handle.assign::<VM>(object);
    }

    /// Store `object` if the handle is null. Returns whether it was stored.
    pub fn store_object_in_handle_if_null(
        &self,
        handle: ObjectHandle,
        object: Option<ObjectReference>,
    ) -> bool {
        handle.compare_exchange::<VM>(object, None).is_none()
    }

    /// Store `object` if the handle holds `comparand`. Returns what the
    /// handle held before.
    pub fn interlocked_compare_exchange_object_in_handle(
        &self,
        handle: ObjectHandle,
        object: Option<ObjectReference>,
        comparand: Option<ObjectReference>,
    ) -> Option<ObjectReference> {
        handle.compare_exchange::<VM>(object, comparand)
    }

    pub fn set_dependent_handle_secondary(
        &self,
        handle: ObjectHandle,
        secondary: Option<ObjectReference>,
    ) {
        debug_assert_eq!(HandleType::of(handle), Some(HandleType::Dependent));
        if let Some(secondary) = secondary {
            handle.write_barrier::<VM>(secondary);
        }
        handle.set_extra_info(HandleType::Dependent.as_u8(), dependent_extra_info(secondary));
    }

    pub fn get_dependent_handle_secondary(&self, handle: ObjectHandle) -> Option<ObjectReference> {
        debug_assert_eq!(HandleType::of(handle), Some(HandleType::Dependent));
        dependent_secondary(handle.extra_info())
    }

    /// `None` if the handle's block holds an unknown type number.
    pub fn handle_fetch_type(&self, handle: ObjectHandle) -> Option<HandleType> {
        HandleType::of(handle)
    }

    /// Number of handles of `ty` in use across every store.
    pub fn count_handles_by_type(&self, ty: HandleType) -> usize {
        let mut count = 0;
        self.map.for_each_bucket(|bucket| {
            count += bucket
                .tables()
                .iter()
                .map(|table| table.count_handles_of_type(ty.as_u8()))
                .sum::<usize>();
        });
        count
    }

    /// Number of handles in use across every store.
    pub fn count_handles(&self) -> usize {
        let mut count = 0;
        self.map
            .for_each_bucket(|bucket| count += bucket.count_handles());
        count
    }

    /// Age the handles after a collection of generations `0..=condemned`, and
    /// check the age map if [`Options::verify_handle_tables`] is set.
    pub fn age_handles(&self, condemned: u8, max_gen: u8, sc: &ScanContext) {
        roots::age_handles(&self.map, condemned, max_gen, sc);
        if self.options.verify_handle_tables {
            let violations = roots::verify_handle_tables::<VM>(&self.map, max_gen, sc);
            for violation in violations.iter() {
                error!(
                    "{:?} is in a clump of age {} but refers to generation {}",
                    violation.handle, violation.clump_age, violation.generation
                );
            }
            debug_assert!(violations.is_empty(), "the handle age map is unsound");
        }
    }
}
