use crate::table::handle::ObjectHandle;
use crate::table::handle_table::HandleTable;
use crate::table::HandleTypeFlags;
use crate::util::directory::Directory;
use crate::vm::{Interop, ScanContext, VMBinding};

/// The handle tables of one owner: one table in workstation mode, one per
/// heap in server mode, so that threads on different heaps do not contend
/// for the same cache.
pub struct HandleTableBucket {
    tables: Box<[Box<HandleTable>]>,
}

impl HandleTableBucket {
    /// Returns `None` if any of the tables cannot be created.
    pub fn new(
        type_flags: &[HandleTypeFlags],
        owner_index: u32,
        table_count: usize,
    ) -> Option<HandleTableBucket> {
        assert!(table_count > 0);
        let tables = (0..table_count)
            .map(|_| HandleTable::new(type_flags, owner_index))
            .collect::<Option<Vec<_>>>()?;
        Some(HandleTableBucket {
            tables: tables.into_boxed_slice(),
        })
    }

    pub fn tables(&self) -> &[Box<HandleTable>] {
        &self.tables
    }

    pub fn table(&self, index: usize) -> &HandleTable {
        &self.tables[index]
    }

    /// The table the calling thread should allocate from.
    pub fn table_for_current_thread<VM: VMBinding>(&self) -> &HandleTable {
        let heap = VM::VMInterop::home_heap_number();
        &self.tables[heap % self.tables.len()]
    }

    /// Index of the bucket in its map.
    pub fn index(&self) -> u32 {
        self.tables[0].index()
    }

    pub fn owner_index(&self) -> u32 {
        self.tables[0].owner_index()
    }

    pub fn contains_handle(&self, handle: ObjectHandle) -> bool {
        self.tables.iter().any(|table| table.contains_handle(handle))
    }

    pub fn count_handles(&self) -> usize {
        self.tables.iter().map(|table| table.count_handles()).sum()
    }

    fn set_index(&self, index: u32) {
        for table in self.tables.iter() {
            table.set_index(index);
        }
    }
}

/// Every bucket of the process, indexed by bucket index.
pub struct HandleTableMap {
    buckets: Directory<HandleTableBucket>,
}

impl HandleTableMap {
    pub fn new(node_size: usize) -> Self {
        HandleTableMap {
            buckets: Directory::new(node_size),
        }
    }

    /// Add a bucket and return its index. The tables of the bucket learn
    /// their index before the bucket becomes reachable through the map.
    pub fn insert_bucket(&self, bucket: HandleTableBucket) -> u32 {
        let index = self
            .buckets
            .insert_with_index(Box::new(bucket), |bucket, index| {
                bucket.set_index(index as u32)
            }) as u32;
        debug!("Inserted handle table bucket {}", index);
        index
    }

    pub fn get_bucket(&self, index: u32) -> Option<&HandleTableBucket> {
        self.buckets.get(index as usize)
    }

    /// Take a bucket out of the map. Its slot may be reused by a later insertion.
    ///
    /// # Safety
    /// No reference to the bucket obtained from this map may be used after
    /// this call, and no scan of the map may be running.
    pub unsafe fn remove_bucket(&self, index: u32) -> Option<HandleTableBucket> {
        debug!("Removing handle table bucket {}", index);
        self.buckets.remove(index as usize).map(|bucket| *bucket)
    }

    pub fn for_each_bucket<'a>(&'a self, mut f: impl FnMut(&'a HandleTableBucket)) {
        self.buckets.for_each(|_, bucket| f(bucket));
    }

    /// The tables the GC thread described by `sc` is responsible for.
    pub fn tables_for_scan(&self, sc: &ScanContext) -> Vec<&HandleTable> {
        let mut tables = Vec::new();
        self.for_each_bucket(|bucket| {
            let count = bucket.tables.len();
            for (index, table) in bucket.tables.iter().enumerate() {
                if sc.owns_table(index, count) {
                    tables.push(&**table);
                }
            }
        });
        tables
    }

    /// Find the bucket whose tables own `handle`.
    pub fn bucket_of(&self, handle: ObjectHandle) -> Option<&HandleTableBucket> {
        self.get_bucket(handle.table().index())
    }
}
