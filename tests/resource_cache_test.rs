use std::{cell::RefCell, rc::Rc};

use futures::channel::oneshot;
use scene_ngin::{Error, Result, resources::cache::ResourceCache};

mod common;

use common::test_utils::*;

#[derive(Debug, PartialEq)]
struct Item(u32);

/// A cache whose disposer records the value of every disposed item.
fn item_cache(ctx: &scene_ngin::context::Context) -> (ResourceCache<Item>, Rc<RefCell<Vec<u32>>>) {
    let disposed = Rc::new(RefCell::new(Vec::new()));
    let log = disposed.clone();
    let cache = ResourceCache::new("items", ctx.spawner(), move |item: &Item| {
        log.borrow_mut().push(item.0)
    });
    (cache, disposed)
}

fn pending_item() -> (oneshot::Sender<Result<Item>>, impl Future<Output = Result<Item>> + 'static) {
    let (tx, rx) = oneshot::channel::<Result<Item>>();
    let future = async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::OutOfBounds("item sender dropped".to_string())),
        }
    };
    (tx, future)
}

#[test]
fn should_build_each_key_once_and_share_the_resource() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);

    let first = cache.acquire_ref("a", |_| async { Ok(Item(1)) });
    let second = cache.acquire_ref("a", |_| async { Ok(Item(2)) });

    assert_eq!(cache.factory_calls(), 1);
    assert_eq!(cache.ref_count("a"), 2);
    let (x, y) = (first.get().unwrap(), second.get().unwrap());
    assert!(Rc::ptr_eq(&x, &y));
    assert_eq!(*x, Item(1));
    drop((x, y));

    first.dispose();
    assert!(disposed.borrow().is_empty());
    assert_eq!(cache.ref_count("a"), 1);

    second.dispose();
    assert_eq!(*disposed.borrow(), vec![1]);
    assert!(!cache.contains("a"));
}

#[test]
fn should_release_a_reference_only_once() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);

    let first = cache.acquire_ref("a", |_| async { Ok(Item(7)) });
    let second = first.clone();
    assert_eq!(cache.ref_count("a"), 2);

    first.dispose();
    first.dispose();
    assert!(first.is_released());
    assert_eq!(cache.ref_count("a"), 1);
    assert!(disposed.borrow().is_empty());

    drop(second);
    assert_eq!(*disposed.borrow(), vec![7]);
}

#[test]
fn should_rebuild_after_the_last_reference_was_released() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);

    cache.acquire_ref("a", |_| async { Ok(Item(1)) }).dispose();
    let again = cache.acquire_ref("a", |_| async { Ok(Item(2)) });

    assert_eq!(cache.factory_calls(), 2);
    assert_eq!(again.get().map(|p| p.0), Some(2));
    assert_eq!(*disposed.borrow(), vec![1]);
}

#[test]
fn should_share_a_pending_build_between_holders() {
    let ctx = headless_context();
    let (cache, _) = item_cache(&ctx);
    let (tx, pending) = pending_item();

    let first = cache.acquire_ref("a", move |_| pending);
    let second = cache.acquire_ref("a", |_| async { Ok(Item(99)) });
    assert!(first.peek().is_none());
    assert!(second.get().is_none());

    tx.send(Ok(Item(3))).unwrap();
    ctx.run_pending();

    assert_eq!(cache.factory_calls(), 1);
    assert!(Rc::ptr_eq(&first.get().unwrap(), &second.get().unwrap()));
    assert_eq!(ctx.block_on(second.promise()).unwrap().0, 3);
}

#[test]
fn should_reject_every_holder_and_evict_on_failure() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);
    let (tx, pending) = pending_item();

    let first = cache.acquire_ref("broken", move |_| pending);
    let second = cache.acquire_ref("broken", |_| async { Ok(Item(0)) });

    tx.send(Err(Error::InvalidGeometry("no data".to_string()))).unwrap();
    ctx.run_pending();

    for holder in [&first, &second] {
        let error = holder.peek().unwrap().unwrap_err();
        assert_eq!(error.key, "broken");
        assert!(matches!(*error.source, Error::InvalidGeometry(_)));
    }
    assert!(!cache.contains("broken"));

    // failed builds are never disposed, and releasing their refs is harmless
    drop((first, second));
    assert!(disposed.borrow().is_empty());

    let retried = cache.acquire_ref("broken", |_| async { Ok(Item(5)) });
    assert_eq!(cache.factory_calls(), 2);
    assert_eq!(retried.get().map(|p| p.0), Some(5));
}

#[test]
fn should_evict_a_synchronous_failure_immediately() {
    let ctx = headless_context();
    let (cache, _) = item_cache(&ctx);

    let failed = cache.acquire_ref("a", |key| {
        let message = format!("{} is unavailable", key);
        async move { Err::<Item, _>(Error::BindingMismatch(message)) }
    });

    assert!(!cache.contains("a"));
    let error = failed.peek().unwrap().unwrap_err();
    assert_eq!(error.source.to_string(), "binding mismatch: a is unavailable");
}

#[test]
fn should_dispose_an_orphan_once_its_build_resolves() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);
    let (tx, pending) = pending_item();

    cache.acquire_ref("a", move |_| pending).dispose();
    assert!(cache.contains("a"));
    assert_eq!(cache.ref_count("a"), 0);

    tx.send(Ok(Item(4))).unwrap();
    ctx.run_pending();

    assert_eq!(*disposed.borrow(), vec![4]);
    assert!(!cache.contains("a"));
}

#[test]
fn should_adopt_an_orphaned_pending_build() {
    let ctx = headless_context();
    let (cache, disposed) = item_cache(&ctx);
    let (tx, pending) = pending_item();

    cache.acquire_ref("a", move |_| pending).dispose();
    let adopted = cache.acquire_ref("a", |_| async { Ok(Item(8)) });
    assert_eq!(cache.factory_calls(), 1);

    tx.send(Ok(Item(6))).unwrap();
    ctx.run_pending();

    assert!(disposed.borrow().is_empty());
    assert_eq!(adopted.get().map(|p| p.0), Some(6));

    adopted.dispose();
    assert_eq!(*disposed.borrow(), vec![6]);
}
