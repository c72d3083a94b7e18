// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based invariants for the VMA list and fault paths
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! INVARIANTS-UNDER-TEST: VMAs stay sorted, page-aligned and disjoint
//! under arbitrary map/unmap/protect sequences; page accounting matches
//! the list; classification is total.

use alloc::sync::Arc;
use alloc::vec::Vec;

use proptest::prelude::*;

use crate::fault::{classify, handle_fault, AccessKind, FaultClass, FaultOutcome, NoFiles};
use crate::frame::HeapFrames;
use crate::page_table::{NullTlb, PAGE_SIZE};
use crate::space::{AddressSpace, USER_BASE, USER_END};
use crate::vma::{Backing, Protection};
use crate::VmError;

const RW: Protection = Protection::READ.union(Protection::WRITE);

fn fresh_space() -> AddressSpace {
    AddressSpace::new(Arc::new(HeapFrames::new()), Arc::new(NullTlb)).expect("address space")
}

#[derive(Clone, Debug)]
enum Op {
    Map { hint_page: usize, pages: usize },
    Unmap { page: usize, pages: usize },
    Protect { page: usize, pages: usize, write: bool },
    Touch { page: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..64, 1usize..8).prop_map(|(hint_page, pages)| Op::Map { hint_page, pages }),
        (1usize..64, 1usize..8).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        (1usize..64, 1usize..8, any::<bool>())
            .prop_map(|(page, pages, write)| Op::Protect { page, pages, write }),
        (1usize..64).prop_map(|page| Op::Touch { page }),
    ]
}

fn apply(space: &mut AddressSpace, op: &Op) {
    match *op {
        Op::Map { hint_page, pages } => {
            let _ = space.map(
                Some(hint_page * PAGE_SIZE),
                pages * PAGE_SIZE,
                RW,
                Backing::Anonymous,
            );
        }
        Op::Unmap { page, pages } => {
            let _ = space.unmap(page * PAGE_SIZE, pages * PAGE_SIZE);
        }
        Op::Protect { page, pages, write } => {
            let prot = if write { RW } else { Protection::READ };
            let _ = space.protect(page * PAGE_SIZE, pages * PAGE_SIZE, prot);
        }
        Op::Touch { page } => {
            let _ = handle_fault(space, page * PAGE_SIZE, AccessKind::Read, &NoFiles);
        }
    }
}

fn check_invariants(space: &AddressSpace) {
    let vmas: Vec<_> = space.vmas().collect();
    let mut last_end = 0;
    let mut pages = 0;
    for vma in &vmas {
        assert_eq!(vma.start % PAGE_SIZE, 0, "start aligned");
        assert_eq!(vma.end % PAGE_SIZE, 0, "end aligned");
        assert!(vma.start < vma.end, "non-empty");
        assert!(vma.start >= USER_BASE && vma.end <= USER_END, "in range");
        assert!(vma.start >= last_end, "sorted and disjoint");
        last_end = vma.end;
        pages += vma.pages();
    }
    assert_eq!(space.total_pages(), pages, "page accounting matches list");
    assert!(
        space.resident_pages() <= space.total_pages(),
        "residency bounded by mapped pages"
    );
}

proptest! {
    #[test]
    fn vma_list_invariants_hold_under_any_sequence(
        ops in proptest::collection::vec(op_strategy(), 1..40)
    ) {
        let mut space = fresh_space();
        for op in &ops {
            apply(&mut space, op);
            check_invariants(&space);
        }
    }

    #[test]
    fn classification_is_total_and_unmapped_without_vmas(
        addr in any::<usize>(),
        access in prop_oneof![
            Just(AccessKind::Read),
            Just(AccessKind::Write),
            Just(AccessKind::Execute),
        ],
    ) {
        let space = fresh_space();
        prop_assert_eq!(classify(&space, addr, access), FaultClass::Unmapped);
    }

    #[test]
    fn unaligned_lengths_are_always_rejected(
        len in (0usize..0x10000).prop_filter("unaligned", |l| l % PAGE_SIZE != 0)
    ) {
        let mut space = fresh_space();
        prop_assert_eq!(
            space.map(None, len, RW, Backing::Anonymous),
            Err(VmError::Unaligned)
        );
    }

    #[test]
    fn placement_lands_in_a_free_aligned_range(
        occupied in proptest::collection::btree_set(1usize..32, 0..8),
        pages in 1usize..4,
    ) {
        let mut space = fresh_space();
        for page in &occupied {
            let _ = space.map(Some(page * PAGE_SIZE), PAGE_SIZE, RW, Backing::Anonymous);
        }
        let base = space
            .map(None, pages * PAGE_SIZE, RW, Backing::Anonymous)
            .expect("plenty of span left");
        prop_assert_eq!(base % PAGE_SIZE, 0);
        for i in 0..pages {
            let vma = space.find_vma(base + i * PAGE_SIZE).expect("covered");
            prop_assert_eq!(vma.start, base);
        }
        check_invariants(&space);
    }

    #[test]
    fn checked_copy_roundtrips_through_faulted_pages(
        data in proptest::collection::vec(any::<u8>(), 1..256),
        offset in 0usize..(2 * PAGE_SIZE - 256),
    ) {
        let mut space = fresh_space();
        let base = space
            .map(None, 2 * PAGE_SIZE, RW, Backing::Anonymous)
            .expect("map");
        prop_assert_eq!(
            handle_fault(&mut space, base, AccessKind::Write, &NoFiles),
            FaultOutcome::Resolved
        );
        prop_assert_eq!(
            handle_fault(&mut space, base + PAGE_SIZE, AccessKind::Write, &NoFiles),
            FaultOutcome::Resolved
        );
        space.copy_to(base + offset, &data).expect("copy in");
        let mut back = alloc::vec![0u8; data.len()];
        space.copy_from(base + offset, &mut back).expect("copy out");
        prop_assert_eq!(data, back);
    }
}
