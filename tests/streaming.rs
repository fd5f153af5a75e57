//! Time-sliced loading through the async package queue.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;
use pkglink::prelude::*;

use tempfile::TempDir;

type Log = Rc<RefCell<Vec<(String, bool)>>>;

fn callback(log: &Log) -> Option<CompletionCallback> {
    let log = Rc::clone(log);
    Some(Box::new(move |package: &str, result: std::result::Result<ObjectId, &Error>| {
        log.borrow_mut().push((package.to_string(), result.is_ok()));
    }))
}

fn contents(objects: &ObjectSpace, package: &str) -> Vec<(String, Vec<u8>)> {
    let root = objects.find_package(package).expect("package");
    let mut out: Vec<(String, Vec<u8>)> = objects
        .iter()
        .filter(|&(id, _)| objects.is_in(id, root))
        .map(|(id, o)| (objects.path_name(id), o.properties.clone()))
        .collect();
    out.sort();
    out
}

#[test]
fn test_zero_budget_makes_progress() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let mut session = session_with(dir.path(), LinkerConfig::new().with_granularity(1));
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Props", None);

    let mut calls = 0;
    let mut last = 0.0f32;
    while queue.process_async_loading(&mut session, Some(Duration::ZERO)) == LoadStatus::Pending {
        calls += 1;
        assert!(calls < 10_000, "no progress under a zero budget");
        let percent = queue.async_load_percentage("Props");
        assert!((0.0..=100.0).contains(&percent));
        assert!(percent >= last);
        last = percent;
    }
    assert!(calls > 5, "a zero budget should need many slices, took {}", calls);
    assert!(queue.is_empty());

    let mut reference = session_with(dir.path(), LinkerConfig::new());
    reference.load_package("Props").expect("load");
    assert_eq!(contents(session.objects(), "Props"), contents(reference.objects(), "Props"));
    for (_, o) in session.objects().iter() {
        assert!(!o.has_any_flags(ObjectFlags::ASYNC_LOADING | ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD));
    }
}

#[test]
fn test_duplicate_requests_share_one_load() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let log: Log = Rc::default();
    let mut session = session(dir.path());
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Props", callback(&log));
    queue.load_package_async("Props", callback(&log));
    queue.load_package_async("Props", None);
    assert_eq!(queue.len(), 1);
    assert!(queue.is_loading());
    assert_eq!(queue.async_load_percentage("Props"), 0.0);
    assert_eq!(queue.async_load_percentage("Elsewhere"), -1.0);

    queue.flush_async_loading(&mut session);
    assert!(!queue.is_loading());
    assert_eq!(queue.async_load_percentage("Props"), -1.0);
    assert_eq!(*log.borrow(), vec![("Props".to_string(), true), ("Props".to_string(), true)]);
    assert_eq!(session.stats().linkers_created, 2);
}

#[test]
fn test_failed_request_reports_and_queue_moves_on() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let log: Log = Rc::default();
    let mut session = session(dir.path());
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Missing", callback(&log));
    queue.load_package_async("Props", callback(&log));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.process_async_loading(&mut session, None), LoadStatus::Done);
    assert_eq!(*log.borrow(), vec![("Missing".to_string(), false), ("Props".to_string(), true)]);
    assert!(find_path(session.objects(), "Props.Chair").is_some());
}

#[test]
fn test_requests_run_in_order() {
    let dir = TempDir::new().expect("temp dir");
    save_props(dir.path(), &SaveOptions::new());

    let log: Log = Rc::default();
    let mut session = session(dir.path());
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Textures", callback(&log));
    queue.load_package_async("Props", callback(&log));
    queue.flush_async_loading(&mut session);
    let order: Vec<String> = log.borrow().iter().map(|(p, _)| p.clone()).collect();
    assert_eq!(order, vec!["Textures", "Props"]);
    // Textures was already loaded when Props imported it.
    assert_eq!(session.stats().linkers_created, 2);
}

#[test]
fn test_in_memory_package_completes_immediately() {
    let dir = TempDir::new().expect("temp dir");
    let log: Log = Rc::default();
    let mut session = session(dir.path());
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Engine", callback(&log));
    queue.flush_async_loading(&mut session);
    assert_eq!(*log.borrow(), vec![("Engine".to_string(), true)]);
    assert_eq!(session.stats().linkers_created, 0);
}

#[test]
fn test_background_io_load() {
    let dir = TempDir::new().expect("temp dir");
    let original = save_props(dir.path(), &SaveOptions::new());

    let config = LinkerConfig::new().with_async_io(true).with_granularity(1);
    let mut session = session_with(dir.path(), config);
    assert!(session.io().is_some());
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Props", None);
    while queue.process_async_loading(&mut session, Some(Duration::from_micros(50))) == LoadStatus::Pending {}
    assert_eq!(contents(session.objects(), "Props"), contents(&original, "Props"));
}

#[test]
fn test_compressed_package_streams() {
    let dir = TempDir::new().expect("temp dir");
    let options = SaveOptions::new().compressed(CompressionFlags::ZLIB);
    let original = save_props(dir.path(), &options);

    let mut session = session_with(dir.path(), LinkerConfig::new().with_granularity(1));
    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async("Props", None);
    while queue.process_async_loading(&mut session, Some(Duration::ZERO)) == LoadStatus::Pending {}
    assert_eq!(contents(session.objects(), "Props"), contents(&original, "Props"));
}
