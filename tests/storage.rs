mod common;

use common::{Flash, Operation};
use nor_nvs::error::Error;
use nor_nvs::{
    EntryInfo, GetValue, Handle, ItemType, Key, OpenMode, SetValue, Storage,
};
use pretty_assertions::assert_eq;

#[test]
fn scalar_round_trip() {
    let mut flash = Flash::new(4);

    {
        let storage = Storage::new(&mut flash).into_shared();
        storage.borrow_mut().init(0, 4).unwrap();

        let cfg = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
        cfg.set(&Key::from_str("boot_count"), 7u32).unwrap();
        assert_eq!(cfg.get::<u32>(&Key::from_str("boot_count")).unwrap(), 7);
    }

    // a fresh mount sees the same value
    {
        let storage = Storage::new(&mut flash).into_shared();
        storage.borrow_mut().init(0, 4).unwrap();

        let cfg = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadOnly).unwrap();
        assert_eq!(cfg.get::<u32>(&Key::from_str("boot_count")).unwrap(), 7);
    }
}

#[test]
fn primitives() {
    let mut flash = Flash::new(4);
    let storage = Storage::new(&mut flash).into_shared();
    storage.borrow_mut().init(0, 4).unwrap();

    let ns = Handle::open(&storage, &Key::from_str("types"), OpenMode::ReadWrite).unwrap();

    ns.set(&Key::from_str("bool"), true).unwrap();
    assert_eq!(ns.get::<bool>(&Key::from_str("bool")).unwrap(), true);

    ns.set(&Key::from_str("u8"), 0xAAu8).unwrap();
    assert_eq!(ns.get::<u8>(&Key::from_str("u8")).unwrap(), 0xAA);

    ns.set(&Key::from_str("i8"), -100i8).unwrap();
    assert_eq!(ns.get::<i8>(&Key::from_str("i8")).unwrap(), -100);

    ns.set(&Key::from_str("u16"), 0xABCDu16).unwrap();
    assert_eq!(ns.get::<u16>(&Key::from_str("u16")).unwrap(), 0xABCD);

    ns.set(&Key::from_str("i16"), -30000i16).unwrap();
    assert_eq!(ns.get::<i16>(&Key::from_str("i16")).unwrap(), -30000);

    ns.set(&Key::from_str("u32"), 0xDEAD_BEEFu32).unwrap();
    assert_eq!(ns.get::<u32>(&Key::from_str("u32")).unwrap(), 0xDEAD_BEEF);

    ns.set(&Key::from_str("i32"), -2_000_000_000i32).unwrap();
    assert_eq!(ns.get::<i32>(&Key::from_str("i32")).unwrap(), -2_000_000_000);

    ns.set(&Key::from_str("u64"), u64::MAX - 1).unwrap();
    assert_eq!(ns.get::<u64>(&Key::from_str("u64")).unwrap(), u64::MAX - 1);

    ns.set(&Key::from_str("i64"), -8_000_000_000_000i64).unwrap();
    assert_eq!(
        ns.get::<i64>(&Key::from_str("i64")).unwrap(),
        -8_000_000_000_000
    );
}

#[test]
fn strings() {
    let mut flash = Flash::new(4);
    let storage = Storage::new(&mut flash).into_shared();
    storage.borrow_mut().init(0, 4).unwrap();

    let ns = Handle::open(&storage, &Key::from_str("text"), OpenMode::ReadWrite).unwrap();

    ns.set(&Key::from_str("char"), "X").unwrap();
    assert_eq!(ns.get::<String>(&Key::from_str("char")).unwrap(), "X");

    let long = "a value long enough to spill across several entry slots of the page";
    ns.set(&Key::from_str("long"), long).unwrap();
    assert_eq!(ns.get::<String>(&Key::from_str("long")).unwrap(), long);

    // stored with its NUL terminator
    assert_eq!(
        ns.data_size(ItemType::Str, &Key::from_str("long")).unwrap(),
        long.len() + 1
    );
}

#[test]
fn overwrite_keeps_latest() {
    let mut flash = Flash::new(4);

    {
        let storage = Storage::new(&mut flash).into_shared();
        storage.borrow_mut().init(0, 4).unwrap();
        let ns = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
        ns.set(&Key::from_str("k"), 1u32).unwrap();
        ns.set(&Key::from_str("k"), 2u32).unwrap();
        assert_eq!(ns.get::<u32>(&Key::from_str("k")).unwrap(), 2);
    }

    common::check_consistency(&flash.buf);

    {
        let storage = Storage::new(&mut flash).into_shared();
        storage.borrow_mut().init(0, 4).unwrap();
        let ns = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadOnly).unwrap();
        assert_eq!(ns.get::<u32>(&Key::from_str("k")).unwrap(), 2);
    }
}

#[test]
fn rewriting_identical_value_is_free() {
    fn run(writes: usize) -> Flash {
        let mut flash = Flash::new(4);
        {
            let storage = Storage::new(&mut flash).into_shared();
            storage.borrow_mut().init(0, 4).unwrap();
            let ns = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
            for _ in 0..writes {
                ns.set(&Key::from_str("k"), 5u8).unwrap();
            }
            assert_eq!(ns.get::<u8>(&Key::from_str("k")).unwrap(), 5);
        }
        flash
    }

    let once = run(1);
    let twice = run(2);

    // the repeated write must not touch the flash at all
    assert_eq!(once.writes(), twice.writes());
    assert_eq!(twice.erases(), 0);
}

#[test]
fn remove_key() {
    let mut flash = Flash::new(4);
    let storage = Storage::new(&mut flash).into_shared();
    storage.borrow_mut().init(0, 4).unwrap();

    let ns = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
    ns.set(&Key::from_str("k"), 1u32).unwrap();
    ns.remove(&Key::from_str("k")).unwrap();

    assert_eq!(
        ns.get::<u32>(&Key::from_str("k")).unwrap_err(),
        Error::NotFound
    );
    assert_eq!(
        ns.remove(&Key::from_str("k")).unwrap_err(),
        Error::NotFound
    );
}

#[test]
fn reading_through_the_wrong_type_is_not_found() {
    let mut flash = Flash::new(4);
    let mut storage = Storage::new(&mut flash);
    storage.init(0, 4).unwrap();

    let ns = storage
        .create_or_open_namespace(&Key::from_str("cfg"), true)
        .unwrap();
    storage.set_value(ns, &Key::from_str("k"), 7u32).unwrap();

    let as_u8: Result<u8, Error> = storage.get_value(ns, &Key::from_str("k"));
    assert_eq!(as_u8.unwrap_err(), Error::NotFound);

    let as_string: Result<String, Error> = storage.get_value(ns, &Key::from_str("k"));
    assert_eq!(as_string.unwrap_err(), Error::NotFound);

    let as_u32: Result<u32, Error> = storage.get_value(ns, &Key::from_str("k"));
    assert_eq!(as_u32.unwrap(), 7);
}

#[test]
fn namespace_indices_are_stable_and_injective() {
    let mut flash = Flash::new(4);

    let (alpha, beta);
    {
        let mut storage = Storage::new(&mut flash);
        storage.init(0, 4).unwrap();
        alpha = storage
            .create_or_open_namespace(&Key::from_str("alpha"), true)
            .unwrap();
        beta = storage
            .create_or_open_namespace(&Key::from_str("beta"), true)
            .unwrap();
        assert_eq!(alpha, 1);
        assert_eq!(beta, 2);
    }

    {
        let mut storage = Storage::new(&mut flash);
        storage.init(0, 4).unwrap();
        assert_eq!(
            storage
                .create_or_open_namespace(&Key::from_str("beta"), false)
                .unwrap(),
            beta
        );
        assert_eq!(
            storage
                .create_or_open_namespace(&Key::from_str("alpha"), false)
                .unwrap(),
            alpha
        );
        assert_eq!(storage.namespace_name(alpha), Some(&Key::from_str("alpha")));
        assert_eq!(
            storage
                .create_or_open_namespace(&Key::from_str("gamma"), false)
                .unwrap_err(),
            Error::NotFound
        );
    }
}

#[test]
fn namespace_exhaustion() {
    let mut flash = Flash::new(6);
    let mut storage = Storage::new(&mut flash);
    storage.init(0, 6).unwrap();

    for i in 1..=254u32 {
        let name = Key::try_new(format!("ns{i}").as_bytes()).unwrap();
        let index = storage.create_or_open_namespace(&name, true).unwrap();
        assert_eq!(index as u32, i);
    }

    let overflow = Key::from_str("one_too_many");
    assert_eq!(
        storage.create_or_open_namespace(&overflow, true).unwrap_err(),
        Error::NoSpace
    );
}

#[test]
fn init_is_refused_while_handles_are_open() {
    let mut flash = Flash::new(4);
    let storage = Storage::new(&mut flash).into_shared();
    storage.borrow_mut().init(0, 4).unwrap();

    let handle = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
    assert_eq!(
        storage.borrow_mut().init(0, 4).unwrap_err(),
        Error::InvalidState
    );

    drop(handle);
    storage.borrow_mut().init(0, 4).unwrap();
}

#[test]
fn read_only_handles_reject_mutation() {
    let mut flash = Flash::new(4);
    let storage = Storage::new(&mut flash).into_shared();
    storage.borrow_mut().init(0, 4).unwrap();

    {
        let rw = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadWrite).unwrap();
        rw.set(&Key::from_str("k"), 3u8).unwrap();
    }

    let ro = Handle::open(&storage, &Key::from_str("cfg"), OpenMode::ReadOnly).unwrap();
    assert_eq!(ro.get::<u8>(&Key::from_str("k")).unwrap(), 3);
    assert_eq!(
        ro.set(&Key::from_str("k"), 4u8).unwrap_err(),
        Error::ReadOnly
    );
    assert_eq!(ro.remove(&Key::from_str("k")).unwrap_err(), Error::ReadOnly);
    assert_eq!(ro.remove_all().unwrap_err(), Error::ReadOnly);

    // opening an unknown namespace read-only must not create it
    assert!(matches!(
        Handle::open(&storage, &Key::from_str("absent"), OpenMode::ReadOnly),
        Err(Error::NotFound)
    ));
}

#[test]
fn iteration_hides_internal_structure() {
    let mut flash = Flash::new(4);
    let mut storage = Storage::new(&mut flash);
    storage.init(0, 4).unwrap();

    let alpha = storage
        .create_or_open_namespace(&Key::from_str("alpha"), true)
        .unwrap();
    storage.set_value(alpha, &Key::from_str("num"), 42u32).unwrap();
    storage.set_value(alpha, &Key::from_str("name"), "hello").unwrap();
    let image = vec![0x5Au8; 6000];
    storage
        .set_value(alpha, &Key::from_str("img"), &image[..])
        .unwrap();

    let beta = storage
        .create_or_open_namespace(&Key::from_str("beta"), true)
        .unwrap();
    storage.set_value(beta, &Key::from_str("flag"), 1u8).unwrap();

    let mut iter = storage.find_entry(None, ItemType::Any).unwrap();
    let mut found = Vec::new();
    while let Some(info) = iter.next_entry().unwrap() {
        found.push(info);
    }

    assert_eq!(
        found,
        vec![
            EntryInfo {
                namespace_index: alpha,
                key: Key::from_str("num"),
                item_type: ItemType::U32,
                data_size: 4,
            },
            EntryInfo {
                namespace_index: alpha,
                key: Key::from_str("name"),
                item_type: ItemType::Str,
                data_size: "hello".len() + 1,
            },
            EntryInfo {
                namespace_index: alpha,
                key: Key::from_str("img"),
                item_type: ItemType::Blob,
                data_size: 6000,
            },
            EntryInfo {
                namespace_index: beta,
                key: Key::from_str("flag"),
                item_type: ItemType::U8,
                data_size: 1,
            },
        ]
    );

    // restartable
    iter.reset();
    let mut count = 0;
    while iter.next_entry().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 4);
    drop(iter);

    // namespace and type bounds
    let mut iter = storage
        .find_entry(Some(&Key::from_str("alpha")), ItemType::U32)
        .unwrap();
    assert_eq!(
        iter.next_entry().unwrap().map(|info| info.key),
        Some(Key::from_str("num"))
    );
    assert_eq!(iter.next_entry().unwrap(), None);
    drop(iter);

    assert!(matches!(
        storage.find_entry(Some(&Key::from_str("missing")), ItemType::Any),
        Err(Error::NotFound)
    ));
}

#[test]
fn erase_namespace_clears_every_item() {
    let mut flash = Flash::new(4);
    let alpha;

    {
        let mut storage = Storage::new(&mut flash);
        storage.init(0, 4).unwrap();

        alpha = storage
            .create_or_open_namespace(&Key::from_str("alpha"), true)
            .unwrap();
        storage.set_value(alpha, &Key::from_str("num"), 42u32).unwrap();
        storage.set_value(alpha, &Key::from_str("name"), "hello").unwrap();
        let blob = vec![0xA5u8; 6000];
        storage
            .set_value(alpha, &Key::from_str("img"), &blob[..])
            .unwrap();

        let beta = storage
            .create_or_open_namespace(&Key::from_str("beta"), true)
            .unwrap();
        storage.set_value(beta, &Key::from_str("keep"), 9u8).unwrap();

        storage.erase_namespace(alpha).unwrap();

        assert_eq!(storage.calc_entries_in_namespace(alpha).unwrap(), 0);
        let gone: Result<u32, Error> = storage.get_value(alpha, &Key::from_str("num"));
        assert_eq!(gone.unwrap_err(), Error::NotFound);
        let kept: Result<u8, Error> = storage.get_value(beta, &Key::from_str("keep"));
        assert_eq!(kept.unwrap(), 9);
    }

    assert_eq!(common::count_items_with_ns(&flash.buf, alpha), 0);
    common::check_consistency(&flash.buf);
}

#[test]
fn stats_and_entry_accounting() {
    let mut flash = Flash::new(4);
    let mut storage = Storage::new(&mut flash);
    storage.init(0, 4).unwrap();

    let cfg = storage
        .create_or_open_namespace(&Key::from_str("cfg"), true)
        .unwrap();
    storage.set_value(cfg, &Key::from_str("a"), 1u8).unwrap();
    storage.set_value(cfg, &Key::from_str("b"), 2u8).unwrap();
    storage.set_value(cfg, &Key::from_str("c"), 3u8).unwrap();
    // "hello" plus NUL spans the header entry and one payload entry
    storage.set_value(cfg, &Key::from_str("s"), "hello").unwrap();

    assert_eq!(storage.calc_entries_in_namespace(cfg).unwrap(), 5);

    let stats = storage.stats().unwrap();
    assert_eq!(stats.namespace_count, 1);
    assert_eq!(stats.page_count, 4);
    assert_eq!(stats.total_entries, 4 * 126);
    // directory entry + three scalars + two string entries
    assert_eq!(stats.used_entries, 6);
    assert_eq!(stats.free_entries, (126 - 6) + 3 * 126);
    assert_eq!(stats.available_entries, stats.free_entries - 126);
}

#[test]
fn last_error_is_sticky_per_operation() {
    let mut flash = Flash::new(4);
    let mut storage = Storage::new(&mut flash);

    assert_eq!(storage.stats().unwrap_err(), Error::NotInitialized);
    assert_eq!(storage.last_error(), Err(Error::NotInitialized));

    storage.init(0, 4).unwrap();
    assert_eq!(storage.last_error(), Ok(()));

    let cfg = storage
        .create_or_open_namespace(&Key::from_str("cfg"), true)
        .unwrap();
    let missing: Result<u32, Error> = storage.get_value(cfg, &Key::from_str("nope"));
    assert_eq!(missing.unwrap_err(), Error::NotFound);
    assert_eq!(storage.last_error(), Err(Error::NotFound));

    storage.set_value(cfg, &Key::from_str("k"), 1u32).unwrap();
    assert_eq!(storage.last_error(), Ok(()));
}

#[test]
fn init_validates_geometry() {
    let mut flash = Flash::new(2);
    let mut storage = Storage::new(&mut flash);

    assert_eq!(storage.init(0, 0).unwrap_err(), Error::InvalidArg);
    // partition reaching past the end of the backing flash
    assert_eq!(storage.init(1, 4).unwrap_err(), Error::InvalidArg);
    assert!(!storage.is_active());

    storage.init(0, 2).unwrap();
    assert!(storage.is_active());
}

#[test]
fn operations_are_logged() {
    // sanity check of the mock itself: a write session leaves a trace
    let mut flash = Flash::new(2);
    {
        let mut storage = Storage::new(&mut flash);
        storage.init(0, 2).unwrap();
        let cfg = storage
            .create_or_open_namespace(&Key::from_str("cfg"), true)
            .unwrap();
        storage.set_value(cfg, &Key::from_str("k"), 1u8).unwrap();
    }
    assert!(flash.operations.iter().any(|op| matches!(op, Operation::Write { .. })));
    assert!(flash.operations.iter().any(|op| matches!(op, Operation::Read { .. })));
}
