#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use zrpc::mem::{self, MemRouter};
use zrpc::{Client, Context, Methods, RemoteError, RpcConfig, Server, Value};

pub const HEARTBEAT: Duration = Duration::from_millis(100);

pub fn config() -> RpcConfig {
	RpcConfig::default()
		.with_heartbeat(Some(HEARTBEAT))
		.with_timeout(Duration::from_secs(3))
}

pub struct Harness {
	pub server: Arc<Server>,
	pub client: Client,
	pub router: MemRouter,
	runner: JoinHandle<zrpc::Result<()>>,
}

impl Harness {
	pub async fn shutdown(self) {
		self.server.stop();
		self.runner.await.unwrap().unwrap();
	}
}

pub fn start(methods: Methods) -> Harness {
	start_with(methods, Context::default(), Context::default(), config())
}

pub fn start_with(methods: Methods, server_context: Context, client_context: Context, config: RpcConfig) -> Harness {
	let _ = tracing_subscriber::fmt::try_init();
	let (router, handle) = mem::router();
	let server = Arc::new(Server::new(
		Arc::new(router),
		methods,
		Arc::new(server_context),
		config.clone(),
	));
	let runner = server.spawn();
	let client = Client::new(Arc::new(handle.connect()), Arc::new(client_context), config);
	Harness {
		server,
		client,
		router: handle,
		runner,
	}
}

fn int(args: &[Value], index: usize) -> Result<i64, RemoteError> {
	args.get(index)
		.and_then(Value::as_i64)
		.ok_or_else(|| RemoteError::new("TypeError", format!("argument {index} must be an integer")))
}

async fn add(args: Vec<Value>) -> Result<Value, RemoteError> {
	Ok(Value::from(int(&args, 0)? + int(&args, 1)?))
}

async fn sleep(args: Vec<Value>) -> Result<Value, RemoteError> {
	let secs = args.first().and_then(Value::as_f64).unwrap_or(0.0);
	tokio::time::sleep(Duration::from_secs_f64(secs)).await;
	Ok(Value::Nil)
}

async fn boom(_: Vec<Value>) -> Result<Value, RemoteError> {
	Err(RemoteError::new("RuntimeError", "boom"))
}

async fn explode(_: Vec<Value>) -> Result<Value, RemoteError> {
	let args_ok = false;
	if !args_ok {
		panic!("handler exploded");
	}
	Ok(Value::Nil)
}

fn range(args: Vec<Value>) -> impl futures::Stream<Item = Result<Value, RemoteError>> {
	let count = int(&args, 0);
	futures::stream::iter(match count {
		Ok(n) => (0..n).map(|i| Ok(Value::from(i))).collect::<Vec<_>>(),
		Err(e) => vec![Err(e)],
	})
}

fn broken(_: Vec<Value>) -> impl futures::Stream<Item = Result<Value, RemoteError>> {
	futures::stream::iter([Err(RemoteError::new("ValueError", "no items"))])
}

/// Items then a failure.
fn partial(_: Vec<Value>) -> impl futures::Stream<Item = Result<Value, RemoteError>> {
	futures::stream::iter([
		Ok(Value::from(1)),
		Ok(Value::from(2)),
		Err(RemoteError::new("IOError", "disk gone")),
	])
}

pub fn methods() -> Methods {
	Methods::new()
		.unary("add", add)
		.unary("sleep", sleep)
		.unary("boom", boom)
		.unary("explode", explode)
		.stream("items", |_| futures::stream::iter([1, 2, 3].map(|i| Ok(Value::from(i)))))
		.stream("range", range)
		.stream("broken", broken)
		.stream("partial", partial)
}
