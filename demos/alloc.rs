use tenure::header::tag_pointer;
use tenure::{collect, HeapObject, OldSpace, WORD_SIZE};

fn main() {
    env_logger::init();
    let mut space = OldSpace::new();
    space.set_allocation_budget(16 * 1024 * 1024);

    let start = std::time::Instant::now();
    let mut roots = vec![];
    let mut i = 0;
    while i < 1_000_000 {
        let size = (2 + i % 14) * WORD_SIZE;
        let mut address = space.allocate(size);
        if address == 0 {
            collect(&mut space, &mut roots);
            address = space.allocate(size);
            assert!(address != 0, "out of memory");
        }
        let object = HeapObject::format_boxed(address, size);
        // Keep a thin spine alive so collections have something to mark.
        if i % 4096 == 0 {
            roots.push(tag_pointer(object.address()));
        }
        i += 1;
    }
    collect(&mut space, &mut roots);

    println!(
        "allocated 1M objects in {:.4} secs; {} bytes live in {} chunks",
        start.elapsed().as_secs_f64(),
        space.used(),
        space.chunk_count()
    );
}
