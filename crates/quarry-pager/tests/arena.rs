//! Process-global page arena configuration.
//!
//! These run in their own test binary so no other test's buffer pools
//! race the "no caches may exist during configuration" rule. The steps
//! share one test function for the same reason.

use quarry_error::QuarryError;
use quarry_pager::{PageBufPool, SlabSpec, arena_available, configure_page_arena};
use quarry_types::PageSize;

#[test]
fn arena_lifecycle() {
    // Install: 4 slots of 4 KiB.
    configure_page_arena(4096, 4).unwrap();
    assert_eq!(arena_available(), Some(4));

    {
        // A pool with no slab draws from the arena before the heap.
        let pool = PageBufPool::new(PageSize::DEFAULT, SlabSpec::Pages(0));
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(arena_available(), Some(2));

        // Reconfiguration is refused while a pool is alive.
        assert!(matches!(
            configure_page_arena(4096, 8),
            Err(QuarryError::Misuse)
        ));

        // Exhaust the arena: further acquisitions fall back to the heap.
        let c = pool.acquire();
        let d = pool.acquire();
        assert_eq!(arena_available(), Some(0));
        let e = pool.acquire();
        assert_eq!(e.len(), 4096);

        // Dropping arena-origin buffers returns their slots.
        drop(a);
        drop(b);
        assert_eq!(arena_available(), Some(2));
        drop(c);
        drop(d);
        drop(e);
        assert_eq!(arena_available(), Some(4));
    }

    // An arena smaller than the page size is never used.
    configure_page_arena(512, 2).unwrap();
    {
        let pool = PageBufPool::new(PageSize::DEFAULT, SlabSpec::Pages(0));
        let buf = pool.acquire();
        assert_eq!(
            arena_available(),
            Some(2),
            "undersized slots must not serve large pages"
        );
        drop(buf);
    }

    // Invalid slot sizes are rejected; zero slots removes the arena.
    assert!(configure_page_arena(100, 4).is_err());
    configure_page_arena(4096, 0).unwrap();
    assert_eq!(arena_available(), None);
}
