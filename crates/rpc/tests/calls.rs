mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use zrpc::hooks::{
	ClientAfterRequest, ClientBeforeRequest, LoadTaskContext, ServerBeforeExec, ServerInspectException, TaskContext,
};
use zrpc::mem;
use zrpc::wire::{CounterIdGen, names};
use zrpc::{
	Client, Context, Envelope, Error, Events, Header, Methods, Middleware, RemoteError, Reply, Result, Value,
};

use common::{config, methods, start, start_with};

#[tokio::test]
async fn add_returns_sum() {
	let harness = start(methods());
	let value = harness
		.client
		.call_value("add", vec![Value::from(2), Value::from(3)])
		.await
		.unwrap();
	assert_eq!(value.as_i64(), Some(5));
	assert_eq!(harness.client.active_channels(), 0);
	harness.shutdown().await;
}

#[tokio::test]
async fn slow_handler_times_out_and_closes_channel() {
	let harness = start(methods());
	let started = Instant::now();
	let err = harness
		.client
		.call_with_timeout("sleep", vec![Value::from(5.0)], Duration::from_secs(1))
		.await
		.unwrap_err();
	let elapsed = started.elapsed();

	match &err {
		Error::Timeout { timeout, when } => {
			assert_eq!(*timeout, Duration::from_secs(1));
			assert_eq!(when, "calling remote method sleep");
		}
		other => panic!("expected a timeout, got {other:?}"),
	}
	assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
	assert!(elapsed < Duration::from_secs(2), "returned late: {elapsed:?}");
	assert_eq!(harness.client.active_channels(), 0);
	harness.shutdown().await;
}

#[tokio::test]
async fn handler_error_becomes_remote_error() {
	let harness = start(methods());
	let err = harness.client.call_value("boom", vec![]).await.unwrap_err();
	let Error::Remote(remote) = err else {
		panic!("expected a remote error, got {err:?}");
	};
	assert_eq!(remote.name, "RuntimeError");
	assert!(remote.message.contains("boom"));
	harness.shutdown().await;
}

#[tokio::test]
async fn unknown_method_is_a_name_error() {
	let harness = start(methods());
	let err = harness.client.call_value("nope", vec![]).await.unwrap_err();
	assert!(matches!(err, Error::Remote(ref r) if r.name == "NameError" && r.message.contains("nope")));
	harness.shutdown().await;
}

#[tokio::test]
async fn handler_panic_is_reported_and_server_survives() {
	let harness = start(methods());
	let err = harness.client.call_value("explode", vec![]).await.unwrap_err();
	assert!(matches!(err, Error::Remote(ref r) if r.name == "Panic" && r.message == "handler exploded"));

	let value = harness
		.client
		.call_value("add", vec![Value::from(1), Value::from(1)])
		.await
		.unwrap();
	assert_eq!(value.as_i64(), Some(2));
	harness.shutdown().await;
}

#[tokio::test]
async fn bad_arguments_surface_handler_error() {
	let harness = start(methods());
	let err = harness
		.client
		.call_value("add", vec![Value::from("two"), Value::from(3)])
		.await
		.unwrap_err();
	assert!(matches!(err, Error::Remote(ref r) if r.name == "TypeError"));
	harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_share_one_socket() {
	let harness = start(methods());
	let pending: Vec<_> = (0..20)
		.map(|i| harness.client.spawn_call("add", vec![Value::from(i), Value::from(100)]))
		.collect();
	for (i, call) in pending.into_iter().enumerate() {
		let Reply::Value(value) = call.join().await.unwrap() else {
			panic!("expected a value");
		};
		assert_eq!(value.as_i64(), Some(i as i64 + 100));
	}
	assert_eq!(harness.client.active_channels(), 0);
	harness.shutdown().await;
}

#[tokio::test]
async fn bounded_pool_serves_calls_in_turn() {
	let harness = start_with(
		methods(),
		Context::default(),
		Context::default(),
		config().with_pool_size(Some(1)),
	);
	let first = harness.client.spawn_call("sleep", vec![Value::from(0.2)]);
	let second = harness.client.spawn_call("sleep", vec![Value::from(0.2)]);
	let started = Instant::now();
	first.join().await.unwrap();
	second.join().await.unwrap();
	assert!(started.elapsed() >= Duration::from_millis(380));
	harness.shutdown().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_calls() {
	let harness = start(methods());
	let call = harness.client.spawn_call("sleep", vec![Value::from(0.3)]);
	tokio::time::sleep(Duration::from_millis(100)).await;
	harness.server.stop();
	assert!(matches!(call.join().await.unwrap(), Reply::Value(Value::Nil)));
	harness.shutdown().await;
}

#[tokio::test]
async fn silent_server_is_reported_lost() {
	let _ = tracing_subscriber::fmt::try_init();
	let (router, handle) = mem::router();
	let silent = Events::new(Arc::new(router), Arc::new(CounterIdGen::new()));
	let client = Client::new(Arc::new(handle.connect()), Arc::new(Context::default()), config());

	let call = client.spawn_call("add", vec![Value::from(1), Value::from(2)]);
	let request = silent.recv().await.unwrap();
	assert_eq!(request.name(), "add");

	let started = Instant::now();
	let err = call.join().await.unwrap_err();
	assert!(err.is_remote_lost(), "unexpected {err:?}");
	assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn legacy_client_gets_single_argument_error() {
	let harness = start(methods());
	let legacy = Events::new(Arc::new(harness.router.connect()), Arc::new(CounterIdGen::new()));
	let header: Header = [("v", Value::from(1))].into_iter().collect();
	legacy.emit("boom", vec![], Some(header)).await.unwrap();

	let reply = tokio::time::timeout(Duration::from_secs(2), legacy.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(reply.name(), names::ERR);
	assert_eq!(reply.args().len(), 1);
	assert!(reply.args()[0].as_str().unwrap().contains("boom"));
	harness.shutdown().await;
}

#[derive(Default)]
struct Recorder {
	before: AtomicUsize,
	after: Mutex<Vec<(String, Option<String>, bool)>>,
	trace_ids: Mutex<Vec<String>>,
	inspected: Mutex<Vec<String>>,
}

impl TaskContext for Recorder {
	fn task_context(&self) -> Header {
		[("trace_id", Value::from("trace-42"))].into_iter().collect()
	}
}

impl ClientBeforeRequest for Recorder {
	fn client_before_request(&self, _request: &Envelope) -> Result<()> {
		self.before.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

impl ClientAfterRequest for Recorder {
	fn client_after_request(&self, request: &Envelope, reply: Option<&Envelope>, error: Option<&Error>) -> Result<()> {
		self.after.lock().push((
			request.name().to_owned(),
			reply.map(|r| r.name().to_owned()),
			error.is_some(),
		));
		Ok(())
	}
}

impl LoadTaskContext for Recorder {
	fn load_task_context(&self, header: &Header) -> Result<()> {
		if let Some(id) = header.get("trace_id").and_then(Value::as_str) {
			self.trace_ids.lock().push(id.to_owned());
		}
		Ok(())
	}
}

impl ServerInspectException for Recorder {
	fn server_inspect_exception(
		&self,
		_request: Option<&Envelope>,
		_reply: Option<&Envelope>,
		error: &RemoteError,
	) -> Result<()> {
		self.inspected.lock().push(error.name.clone());
		Ok(())
	}
}

impl Middleware for Recorder {
	fn task_context(self: Arc<Self>) -> Option<Arc<dyn TaskContext>> {
		Some(self)
	}

	fn client_before_request(self: Arc<Self>) -> Option<Arc<dyn ClientBeforeRequest>> {
		Some(self)
	}

	fn client_after_request(self: Arc<Self>) -> Option<Arc<dyn ClientAfterRequest>> {
		Some(self)
	}

	fn load_task_context(self: Arc<Self>) -> Option<Arc<dyn LoadTaskContext>> {
		Some(self)
	}

	fn server_inspect_exception(self: Arc<Self>) -> Option<Arc<dyn ServerInspectException>> {
		Some(self)
	}
}

#[tokio::test]
async fn hooks_observe_the_call_lifecycle() {
	let client_hooks = Arc::new(Recorder::default());
	let server_hooks = Arc::new(Recorder::default());
	let mut client_context = Context::default();
	assert_eq!(client_context.register(Arc::clone(&client_hooks)), 5);
	let mut server_context = Context::default();
	server_context.register(Arc::clone(&server_hooks));

	let harness = start_with(methods(), server_context, client_context, config());
	harness
		.client
		.call_value("add", vec![Value::from(1), Value::from(2)])
		.await
		.unwrap();
	harness.client.call_value("boom", vec![]).await.unwrap_err();
	harness
		.client
		.call_with_timeout("sleep", vec![Value::from(1.0)], Duration::from_millis(100))
		.await
		.unwrap_err();

	assert_eq!(client_hooks.before.load(Ordering::SeqCst), 3);
	assert_eq!(
		*client_hooks.after.lock(),
		vec![
			("add".to_owned(), Some(names::OK.to_owned()), false),
			("boom".to_owned(), Some(names::ERR.to_owned()), true),
			("sleep".to_owned(), None, true),
		]
	);
	assert_eq!(*server_hooks.trace_ids.lock(), vec!["trace-42"; 3]);
	assert_eq!(*server_hooks.inspected.lock(), vec!["RuntimeError".to_owned()]);
	harness.shutdown().await;
}

#[tokio::test]
async fn unrecognised_reply_still_runs_after_request_hook() {
	let _ = tracing_subscriber::fmt::try_init();
	let recorder = Arc::new(Recorder::default());
	let mut context = Context::default();
	context.register(Arc::clone(&recorder));
	let (router, handle) = mem::router();
	let server = Events::new(Arc::new(router), Arc::new(CounterIdGen::new()));
	let client = Client::new(Arc::new(handle.connect()), Arc::new(context), config());

	let call = client.spawn_call("add", vec![Value::from(1), Value::from(2)]);
	let request = server.recv().await.unwrap();
	let mut reply = server.create_event("WEIRD", vec![], None);
	reply.header_mut().set_response_to(request.message_id().unwrap().to_owned());
	reply.set_identity(request.identity().map(<[_]>::to_vec));
	server.emit_event(&reply).await.unwrap();

	let err = call.join().await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "unexpected {err:?}");
	assert_eq!(
		*recorder.after.lock(),
		vec![("add".to_owned(), Some("WEIRD".to_owned()), true)]
	);
	assert_eq!(client.active_channels(), 0);
}

struct Gatekeeper;

impl ServerBeforeExec for Gatekeeper {
	fn server_before_exec(&self, request: &Envelope) -> Result<()> {
		if request.name() == "add" {
			return Err(Error::Hook("add is disabled".into()));
		}
		Ok(())
	}
}

impl Middleware for Gatekeeper {
	fn server_before_exec(self: Arc<Self>) -> Option<Arc<dyn ServerBeforeExec>> {
		Some(self)
	}
}

#[tokio::test]
async fn failing_server_hook_is_reported_to_caller() {
	let mut server_context = Context::default();
	server_context.register(Arc::new(Gatekeeper));
	let harness = start_with(
		Methods::new().unary("add", |_| async { Ok(Value::from(0)) }),
		server_context,
		Context::default(),
		config(),
	);
	let err = harness.client.call_value("add", vec![]).await.unwrap_err();
	assert!(matches!(err, Error::Remote(ref r) if r.name == "HookError" && r.message.contains("add is disabled")));
	harness.shutdown().await;
}

struct Censor;

impl ServerInspectException for Censor {
	fn server_inspect_exception(
		&self,
		_request: Option<&Envelope>,
		_reply: Option<&Envelope>,
		_error: &RemoteError,
	) -> Result<()> {
		Err(Error::Hook("error replies are disabled".into()))
	}
}

impl Middleware for Censor {
	fn server_inspect_exception(self: Arc<Self>) -> Option<Arc<dyn ServerInspectException>> {
		Some(self)
	}
}

#[tokio::test]
async fn failing_inspect_hook_suppresses_error_reply() {
	let mut server_context = Context::default();
	server_context.register(Arc::new(Censor));
	let harness = start_with(methods(), server_context, Context::default(), config());
	let err = harness
		.client
		.call_with_timeout("boom", vec![], Duration::from_secs(1))
		.await
		.unwrap_err();
	assert!(err.is_remote_lost() || err.is_timeout(), "unexpected {err:?}");

	let value = harness
		.client
		.call_value("add", vec![Value::from(2), Value::from(2)])
		.await
		.unwrap();
	assert_eq!(value.as_i64(), Some(4));
	harness.shutdown().await;
}
