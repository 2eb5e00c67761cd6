use super::*;
use gchandles::HandleType;

const BULK: usize = 1024;

pub fn bench(c: &mut Criterion) {
    let manager = manager();
    let store = manager.global_handle_store().unwrap();

    c.bench_function("create_destroy_handle", |b| {
        b.iter(|| {
            let handle = store
                .create_handle_of_type(object(1), HandleType::Strong)
                .unwrap();
            manager.destroy_handle_of_type(handle, HandleType::Strong);
        })
    });

    let table = store.bucket().table(0);
    c.bench_function("create_destroy_handles_bulk", |b| {
        b.iter(|| {
            let handles = table.create_handles(HandleType::WeakShort.as_u8(), BULK);
            table.destroy_handles(HandleType::WeakShort.as_u8(), &handles);
        })
    });
}
