//! Integration Tests for Request Routing
//!
//! These tests drive handler graphs through the public invokers and check
//! that caching, transactions and private scopes work together.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use switchyard_core::cache::{extract_scripts, render_script};
use switchyard_core::handlers::HandlerNode;
use switchyard_core::transport::{from_http, respond};
use switchyard_core::{
    context, Args, CoreError, HandlerRecord, Invokers, ReactiveCache, Request, RequestDescriptor,
};
use tracing_subscriber::EnvFilter;

switchyard_core::requests! {
    struct Counter = "Counter" {
        fn get_count() -> i64 = "getCount";
        fn increment() -> i64 = "increment";
    }
}

switchyard_core::requests! {
    struct Client1 = "Client1" {
        fn get_count() -> i64 = "getCount";
        fn increment() -> i64 = "increment";
    }
}

switchyard_core::requests! {
    struct Client2 = "Client2" {
        fn get_count() -> i64 = "getCount";
        fn increment() -> i64 = "increment";
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A counter record plus how often its `getCount` body ran.
struct CounterState {
    count: Arc<AtomicI64>,
    reads: Arc<AtomicUsize>,
}

impl CounterState {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicI64::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn record(&self) -> HandlerRecord {
        let (count, reads) = (self.count.clone(), self.reads.clone());
        let get_count = move |_: Args| {
            reads.fetch_add(1, Ordering::SeqCst);
            let value = count.load(Ordering::SeqCst);
            async move { Ok(value) }
        };
        let count = self.count.clone();
        let increment = move |_: Args| {
            let value = count.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(value) }
        };
        HandlerRecord::new()
            .handler("getCount", get_count)
            .handler("increment", increment)
    }
}

/// Test that queries are memoized and that a mutation makes its new value
/// visible with exactly one more handler run.
#[tokio::test]
async fn counter_reads_once_per_generation() {
    init_tracing();
    let counter = CounterState::new();
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record()),
    );

    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));
    assert_eq!(counter.reads(), 1);

    assert_eq!(invokers.mutate(&Counter::increment()).await, Ok(1));
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(1));
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(1));
    assert_eq!(counter.reads(), 2);
}

/// Test that mutating one record leaves another record's cache alone.
#[tokio::test]
async fn mutations_stay_within_their_prefix() {
    init_tracing();
    let first = CounterState::new();
    let second = CounterState::new();
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Client1", first.record())
            .child("Client2", second.record()),
    );

    assert_eq!(invokers.query(&Client1::get_count()).await, Ok(0));
    assert_eq!(invokers.query(&Client2::get_count()).await, Ok(0));

    invokers.mutate(&Client2::increment()).await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(invokers.query(&Client1::get_count()).await, Ok(0));
    assert_eq!(invokers.query(&Client2::get_count()).await, Ok(1));
    assert_eq!(first.reads(), 1);
    assert_eq!(second.reads(), 2);
}

/// Test that a query built on another query follows its source across
/// prefixes.
#[tokio::test]
async fn derived_queries_follow_their_sources() {
    init_tracing();
    let counter = CounterState::new();
    let renders = Arc::new(AtomicUsize::new(0));
    let label_renders = renders.clone();
    let label = move |_: Args| {
        label_renders.fetch_add(1, Ordering::SeqCst);
        async move {
            let count = Invokers::global().query(&Counter::get_count()).await?;
            Ok(format!("count is {count}"))
        }
    };
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record())
            .child("View", HandlerRecord::new().handler("label", label)),
    );
    let label: Request<String> = Request::new(["View", "label"], vec![]);

    assert_eq!(invokers.query(&label).await.as_deref(), Ok("count is 0"));
    assert_eq!(invokers.query(&label).await.as_deref(), Ok("count is 0"));
    assert_eq!(renders.load(Ordering::SeqCst), 1);

    invokers.mutate(&Counter::increment()).await.unwrap();
    assert_eq!(invokers.query(&label).await.as_deref(), Ok("count is 1"));
    assert_eq!(renders.load(Ordering::SeqCst), 2);
    assert_eq!(counter.reads(), 2);
}

/// Test that a dispatch waits for the events its listeners emit, even when
/// those finish later.
#[tokio::test]
async fn dispatch_waits_for_emitted_events() {
    init_tracing();
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = delivered.clone();
    let graph = HandlerRecord::new()
        .child(
            "Orders",
            HandlerRecord::new().handler("placed", |args: Args| async move {
                let id: i64 = args.get(0)?;
                Invokers::global().emit(RequestDescriptor::new(["Mail", "send"], vec![json!(id)]));
                Ok(())
            }),
        )
        .child(
            "Mail",
            HandlerRecord::new().handler("send", move |_: Args| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

    Invokers::new(graph)
        .dispatch(&RequestDescriptor::new(["Orders", "placed"], vec![json!(7)]))
        .await
        .unwrap();
    assert!(delivered.load(Ordering::SeqCst));
}

/// Test that a failing follow-up fails the dispatch that queued it.
#[tokio::test]
async fn failed_follow_up_fails_the_root() {
    init_tracing();
    let graph = HandlerRecord::new()
        .child(
            "Orders",
            HandlerRecord::new().handler("placed", |_: Args| async {
                Invokers::global().emit(RequestDescriptor::new(["Mail", "send"], vec![]));
                Ok(())
            }),
        )
        .child(
            "Mail",
            HandlerRecord::new().handler("send", |_: Args| async {
                Err::<(), _>(CoreError::handler("smtp unavailable"))
            }),
        );

    let result = Invokers::new(graph)
        .dispatch(&RequestDescriptor::new(["Orders", "placed"], vec![]))
        .await;
    assert_eq!(result, Err(CoreError::Handler("smtp unavailable".into())));
}

struct Database {
    name: &'static str,
}

fn warehouse() -> HandlerRecord {
    HandlerRecord::new()
        .internal(
            HandlerRecord::new()
                .child("database", HandlerNode::value(Database { name: "inventory" }))
                .handler("stockLevel", |_: Args| async { Ok(12) }),
        )
        .handler("describe", |_: Args| async {
            let db = context::inject::<Database>("database")?;
            let stock: i64 = Invokers::global()
                .query(&Request::new(["Warehouse", "stockLevel"], vec![]))
                .await?;
            Ok(format!("{}: {stock}", db.name))
        })
}

/// Test that private nodes serve their own record's handlers only.
#[tokio::test]
async fn private_nodes_are_hidden_from_outside() {
    init_tracing();
    let graph = HandlerRecord::new()
        .child("Warehouse", warehouse())
        .child(
            "Shop",
            HandlerRecord::new().handler("peek", |_: Args| async {
                let db = context::inject::<Database>("database")?;
                Ok(db.name)
            }),
        );
    let invokers = Invokers::new(graph);

    assert_eq!(
        invokers
            .query_value(&RequestDescriptor::new(["Warehouse", "describe"], vec![]))
            .await,
        Ok(json!("inventory: 12"))
    );
    assert_eq!(
        invokers
            .query_value(&RequestDescriptor::new(["Warehouse", "stockLevel"], vec![]))
            .await,
        Err(CoreError::NoHandler {
            path: "Warehouse.stockLevel".into()
        })
    );
    assert_eq!(
        invokers
            .query_value(&RequestDescriptor::new(["Shop", "peek"], vec![]))
            .await,
        Err(CoreError::NoInjectable {
            path: "database".into()
        })
    );
    assert!(matches!(
        context::inject::<Database>("database"),
        Err(CoreError::NoContext { .. })
    ));
}

/// Test that a server-rendered snapshot spares the client its first run.
#[tokio::test]
async fn snapshots_travel_through_markup() {
    init_tracing();
    let server_counter = CounterState::new();
    server_counter.count.store(41, Ordering::SeqCst);
    let server_cache = Arc::new(ReactiveCache::new());
    let server = Invokers::new(
        HandlerRecord::new()
            .cache(server_cache.clone())
            .child("Counter", server_counter.record()),
    );
    server.query(&Counter::get_count()).await.unwrap();
    let html = format!(
        "<html><body>{}</body></html>",
        render_script(&server_cache.snapshot()).unwrap()
    );

    let client_counter = CounterState::new();
    let client_cache = Arc::new(ReactiveCache::new());
    client_cache.hydrate(extract_scripts(&html));
    let client = Invokers::new(
        HandlerRecord::new()
            .cache(client_cache.clone())
            .child("Counter", client_counter.record()),
    );

    assert_eq!(client.query(&Counter::get_count()).await, Ok(41));
    assert_eq!(client_counter.reads(), 0);

    client.invalidate(Counter::get_count().into_descriptor());
    assert_eq!(client.query(&Counter::get_count()).await, Ok(0));
    assert_eq!(client_counter.reads(), 1);
}

/// Test the HTTP boundary end to end.
#[tokio::test]
async fn http_calls_reach_the_graph() {
    init_tracing();
    let counter = CounterState::new();
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record()),
    );

    let read = respond(&invokers, from_http("GET", "/proxy/Counter/getCount", &[])).await;
    assert_eq!((read.status, read.body), (200, b"0".to_vec()));

    let write = respond(&invokers, from_http("POST", "/proxy/Counter/increment", b"[]")).await;
    assert_eq!((write.status, write.body), (200, b"1".to_vec()));

    let read = respond(&invokers, from_http("GET", "/proxy/Counter/getCount", &[])).await;
    assert_eq!((read.status, read.body), (200, b"1".to_vec()));
    assert_eq!(counter.reads(), 2);

    let missing = respond(&invokers, from_http("GET", "/proxy/Counter/reset", &[])).await;
    assert_eq!(missing.status, 404);
}

/// Test that a query which stops reading a source is no longer re-run when
/// that source changes.
#[tokio::test]
async fn switched_branches_stop_observing_old_sources() {
    init_tracing();
    let use_b = Arc::new(AtomicBool::new(false));
    let renders = Arc::new(AtomicUsize::new(0));
    let a_runs = Arc::new(AtomicI64::new(0));

    let (flag, counter) = (use_b.clone(), renders.clone());
    let view = move |_: Args| {
        counter.fetch_add(1, Ordering::SeqCst);
        let source = if flag.load(Ordering::SeqCst) { "b" } else { "a" };
        async move {
            let value: i64 = Invokers::global()
                .query(&Request::new(["Src", source], vec![]))
                .await?;
            Ok(value)
        }
    };
    let runs = a_runs.clone();
    let src = HandlerRecord::new()
        .handler("a", move |_: Args| {
            let n = runs.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        })
        .handler("b", |_: Args| async { Ok(100) });
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Src", src)
            .child("View", HandlerRecord::new().handler("v", view)),
    );
    let v: Request<i64> = Request::new(["View", "v"], vec![]);

    assert_eq!(invokers.query(&v).await, Ok(0));
    use_b.store(true, Ordering::SeqCst);
    invokers.invalidate(v.descriptor().clone());
    assert_eq!(invokers.query(&v).await, Ok(100));
    assert_eq!(renders.load(Ordering::SeqCst), 2);

    invokers.invalidate(RequestDescriptor::new(["Src", "a"], vec![]));
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(a_runs.load(Ordering::SeqCst), 2);
    assert_eq!(invokers.query(&v).await, Ok(100));
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

/// Test that selections shape what the caller sees while the cache keeps the
/// raw result.
#[tokio::test]
async fn selections_apply_after_the_cache() {
    init_tracing();
    let counter = CounterState::new();
    counter.count.store(4, Ordering::SeqCst);
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record()),
    );

    let tenfold = Counter::get_count().select(|n: i64| n * 10);
    assert_eq!(invokers.query(&tenfold).await, Ok(40));
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(4));
    assert_eq!(counter.reads(), 1);

    let announced = Counter::increment().select(|n: i64| format!("now {n}"));
    assert_eq!(invokers.mutate(&announced).await.as_deref(), Ok("now 5"));
    assert_eq!(invokers.query(&tenfold).await, Ok(50));
}

/// Test that a pass-through record serves everything below it.
#[tokio::test]
async fn unwrap_hooks_serve_the_rest_of_the_path() {
    init_tracing();
    let remote = HandlerRecord::new().unwrap_with(|request: RequestDescriptor| {
        async move { Ok(json!({ "path": request.dotted_path(), "args": request.args() })) }.boxed()
    });
    let invokers = Invokers::new(HandlerRecord::new().child("Remote", remote));

    let answer = invokers
        .query_value(&RequestDescriptor::new(["Remote", "users", "list"], vec![json!(2)]))
        .await;
    assert_eq!(answer, Ok(json!({ "path": "users.list", "args": [2] })));
}

/// Test that a listener mounted above the event's path hears the event in
/// its wire form, next to the direct handler.
#[tokio::test]
async fn topic_listeners_hear_dispatched_events() {
    init_tracing();
    let heard = Arc::new(Mutex::new(Vec::<Value>::new()));
    let direct = Arc::new(AtomicUsize::new(0));

    let sink = heard.clone();
    let audit = HandlerNode::leaf(move |args: Args| {
        let sink = sink.clone();
        async move {
            let event: Value = args.get(0)?;
            sink.lock().push(event);
            Ok(())
        }
    });
    let hits = direct.clone();
    let graph = HandlerNode::sequence([
        HandlerRecord::new()
            .child(
                "Orders",
                HandlerRecord::new().handler("placed", move |_: Args| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }),
            )
            .into_node(),
        HandlerRecord::new().child("Orders", audit).into_node(),
    ]);

    Invokers::new(graph)
        .dispatch(&RequestDescriptor::new(["Orders", "placed"], vec![json!(7)]))
        .await
        .unwrap();
    assert_eq!(direct.load(Ordering::SeqCst), 1);
    assert_eq!(
        *heard.lock(),
        vec![json!({ "type": ["Orders", "placed"], "payload": [7] })]
    );
}

/// Test that several mutations in one transaction lead to one stabilization
/// pass, which subscribers see as a single update.
#[tokio::test]
async fn mutation_bursts_stabilize_once() {
    init_tracing();
    let counter = CounterState::new();
    let cache = Arc::new(ReactiveCache::new());
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(cache.clone())
            .child("Counter", counter.record()),
    );
    invokers.query(&Counter::get_count()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = cache
        .subscribe(Counter::get_count().descriptor(), move |value| {
            sink.lock().push(value.clone())
        })
        .unwrap();

    let writer = invokers.clone();
    invokers
        .transaction(Map::new(), async move {
            for _ in 0..3 {
                writer.mutate(&Counter::increment()).await?;
            }
            Ok(())
        })
        .await
        .unwrap();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    assert_eq!(*seen.lock(), vec![json!(3)]);
    assert_eq!(counter.reads(), 2);
}

/// Test that `no_cache` runs the handler and leaves the cached value alone.
#[tokio::test]
async fn no_cache_reads_go_straight_to_the_handler() {
    init_tracing();
    let counter = CounterState::new();
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record()),
    );

    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));
    counter.count.store(9, Ordering::SeqCst);

    assert_eq!(context::no_cache(invokers.query(&Counter::get_count())).await, Ok(9));
    assert_eq!(counter.reads(), 2);
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));
    assert_eq!(counter.reads(), 2);
}

/// Test that an event emitted outside any call still reaches its handler.
#[tokio::test]
async fn detached_emits_still_run() {
    init_tracing();
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = delivered.clone();
    let invokers = Invokers::new(HandlerRecord::new().child(
        "Mail",
        HandlerRecord::new().handler("send", move |_: Args| {
            flag.store(true, Ordering::SeqCst);
            async { Ok(()) }
        }),
    ));

    invokers.emit(RequestDescriptor::new(["Mail", "send"], vec![]));
    tokio::time::timeout(Duration::from_secs(1), async {
        while !delivered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Test that a failed root-level mutation does not refresh the cache.
#[tokio::test]
async fn failed_mutations_invalidate_nothing() {
    init_tracing();
    let counter = CounterState::new();
    let invokers = Invokers::new(
        HandlerRecord::new()
            .cache(ReactiveCache::shared())
            .child("Counter", counter.record())
            .handler("reset", |_: Args| async {
                Err::<(), _>(CoreError::handler("read only"))
            }),
    );
    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));

    let reset = invokers
        .mutate_value(&RequestDescriptor::new(["reset"], vec![]))
        .await;
    assert_eq!(reset, Err(CoreError::Handler("read only".into())));
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    assert_eq!(invokers.query(&Counter::get_count()).await, Ok(0));
    assert_eq!(counter.reads(), 1);
}
