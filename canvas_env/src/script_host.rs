//! The script host - runs one agent's code against one snapshot.
//!
//! Agent code is a Rhai script defining `fn on_tick(api)`. The host builds a
//! raw engine with only pure packages registered (no clock, no I/O, no
//! randomness), so a run is a function of its request alone. The `api`
//! handed to the script is the agent's entire capability surface:
//!
//! | Member | Effect |
//! |---|---|
//! | `api.agent`, `api.now` | read-only agent info and virtual time (ms) |
//! | `api.incoming`, `api.transactions` | read-only incoming / outgoing transactions |
//! | `api.state` | private persistent state, written back after a successful run |
//! | `api.log(msg)`, `api.warn(msg)`, `print(msg)` | append to the run's logs |
//! | `api.create_transaction`, `api.transition_state`, `api.release_escrow`, `api.cancel`, `api.dispute`, `api.submit_job` | append an op |
//!
//! Command builders only record ops. Nothing reaches the world until the
//! orchestrator hands the ops to the store.

use crate::meter;
use crate::protocol::ExecuteRequest;
use crate::types::{
    AgentId, ErrorKind, ExecutionSnapshot, LogEntry, Op, RunResult, SandboxLimits, ScriptError,
    TxId, TxState,
};

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{
    Array, CallFnOptions, Dynamic, Engine, EvalAltResult, Map, ParseError, ParseErrorType,
    Position, Scope, AST, INT,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Name of the function every agent script must define.
pub const TICK_HANDLER: &str = "on_tick";

/// Upper bound on ops a single run may emit.
pub const MAX_OPS_PER_RUN: usize = 1_024;

/// Approximate interpreter stack usage per script call level.
const FRAME_BYTES: u64 = 8 * 1024;

/// How many interpreter operations pass between deadline checks.
const PROGRESS_CHECK_INTERVAL: u64 = 256;

const TIMED_OUT: &str = "timed_out";
const ABORTED: &str = "aborted";
const OUT_OF_MEMORY: &str = "out_of_memory";

/// Mutable state of the run in progress, shared with the `api` object.
#[derive(Default)]
struct TickSession {
    agent: Map,
    now: INT,
    incoming: Array,
    outgoing: Array,
    state: Map,
    id_counter: u64,
    ops: Vec<Op>,
    logs: Vec<LogEntry>,
}

impl TickSession {
    fn begin(&mut self, snapshot: &ExecutionSnapshot) -> Result<(), Box<EvalAltResult>> {
        *self = TickSession {
            agent: rhai::serde::to_dynamic(&snapshot.agent)?
                .try_cast::<Map>()
                .unwrap_or_default(),
            now: INT::try_from(snapshot.virtual_time_ms).unwrap_or(INT::MAX),
            incoming: to_array(&snapshot.incoming_transactions)?,
            outgoing: to_array(&snapshot.transactions)?,
            state: rhai::serde::to_dynamic(&snapshot.persistent_state)?
                .try_cast::<Map>()
                .unwrap_or_default(),
            id_counter: snapshot.id_counter,
            ops: Vec::new(),
            logs: Vec::new(),
        };
        Ok(())
    }

    fn push_op(&mut self, op: Op) -> Result<(), Box<EvalAltResult>> {
        if self.ops.len() >= MAX_OPS_PER_RUN {
            return Err(Box::new(EvalAltResult::ErrorDataTooLarge(
                format!("op list (max {})", MAX_OPS_PER_RUN),
                Position::NONE,
            )));
        }
        self.ops.push(op);
        Ok(())
    }
}

fn to_array<T: serde::Serialize>(items: &[T]) -> Result<Array, Box<EvalAltResult>> {
    items.iter().map(rhai::serde::to_dynamic).collect()
}

fn to_u64(value: INT, what: &str) -> Result<u64, Box<EvalAltResult>> {
    u64::try_from(value).map_err(|_| format!("{} must be non-negative, got {}", what, value).into())
}

/// The object scripts receive as `api`.
#[derive(Clone)]
struct AgentApi {
    session: Rc<RefCell<TickSession>>,
}

impl AgentApi {
    fn log(&mut self, entry: LogEntry) {
        self.session.borrow_mut().logs.push(entry);
    }

    fn emit(&mut self, op: Op) -> Result<(), Box<EvalAltResult>> {
        self.session.borrow_mut().push_op(op)
    }

    fn create_transaction(
        &mut self,
        provider: INT,
        amount: INT,
        service: &str,
    ) -> Result<INT, Box<EvalAltResult>> {
        let provider = AgentId(to_u64(provider, "provider id")?);
        let amount_micro = to_u64(amount, "amount")?;

        // The counter holds the next id the store will hand out.
        let mut session = self.session.borrow_mut();
        let hint = session.id_counter;
        session.id_counter += 1;
        session.push_op(Op::CreateTx {
            provider,
            amount_micro,
            service: service.to_string(),
            id_hint: Some(TxId(hint)),
        })?;
        Ok(INT::try_from(hint).unwrap_or(INT::MAX))
    }

    fn transition_state(&mut self, tx: INT, state: &str) -> Result<(), Box<EvalAltResult>> {
        let to: TxState = state.parse().map_err(|e: String| -> Box<EvalAltResult> { e.into() })?;
        let tx = TxId(to_u64(tx, "transaction id")?);
        self.emit(Op::TransitionState { tx, to })
    }

    fn release_escrow(&mut self, tx: INT) -> Result<(), Box<EvalAltResult>> {
        let tx = TxId(to_u64(tx, "transaction id")?);
        self.emit(Op::ReleaseEscrow { tx })
    }

    fn cancel(&mut self, tx: INT) -> Result<(), Box<EvalAltResult>> {
        let tx = TxId(to_u64(tx, "transaction id")?);
        self.emit(Op::Cancel { tx })
    }

    fn dispute(&mut self, tx: INT, reason: &str) -> Result<(), Box<EvalAltResult>> {
        let tx = TxId(to_u64(tx, "transaction id")?);
        self.emit(Op::Dispute { tx, reason: reason.to_string() })
    }

    fn submit_job(&mut self, tx: INT, payload: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let tx = TxId(to_u64(tx, "transaction id")?);
        let payload: serde_json::Value = rhai::serde::from_dynamic(&payload)?;
        self.emit(Op::SubmitJob { tx, payload })
    }
}

/// Executes agent scripts under host-enforced limits.
///
/// Not `Send`: a host lives and dies on the worker thread that created it.
pub struct ScriptHost {
    engine: Engine,
    limits: SandboxLimits,
    session: Rc<RefCell<TickSession>>,
    deadline: Rc<Cell<Option<Instant>>>,

    /// Thread heap tally when the run in progress started
    heap_floor: Rc<Cell<Option<isize>>>,

    /// Last compiled script, keyed by its source
    compiled: Option<(String, AST)>,
}

impl ScriptHost {
    /// Creates a host enforcing `limits`.
    ///
    /// `abort` lets the owning side stop a run in flight; it is checked
    /// alongside the execution deadline.
    pub fn new(limits: SandboxLimits, abort: Arc<AtomicBool>) -> Self {
        let session = Rc::new(RefCell::new(TickSession::default()));
        let deadline = Rc::new(Cell::new(None));
        let heap_floor = Rc::new(Cell::new(None));
        let engine = build_engine(
            &limits,
            Rc::clone(&session),
            Rc::clone(&deadline),
            Rc::clone(&heap_floor),
            abort,
        );

        Self {
            engine,
            limits,
            session,
            deadline,
            heap_floor,
            compiled: None,
        }
    }

    /// Returns the limits this host enforces.
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Runs the script's tick handler once.
    ///
    /// Never panics on bad scripts and never returns partial ops: a failed
    /// run yields no ops and no state, only logs and a classified error.
    pub fn execute(&mut self, request: &ExecuteRequest) -> RunResult {
        let request_id = request.request_id;
        let id_counter = request.snapshot.id_counter;

        let ast = match self.compile(&request.code) {
            Ok(ast) => ast,
            Err(error) => return RunResult::failed(request_id, id_counter, error, Vec::new()),
        };

        let has_handler = ast
            .iter_functions()
            .any(|f| f.name == TICK_HANDLER && f.params.len() == 1);
        if !has_handler {
            let error = ScriptError::new(
                ErrorKind::Runtime,
                format!("script does not define {}(api)", TICK_HANDLER),
            );
            return RunResult::failed(request_id, id_counter, error, Vec::new());
        }

        if let Err(err) = self.session.borrow_mut().begin(&request.snapshot) {
            let error = ScriptError::new(
                ErrorKind::Runtime,
                format!("snapshot could not be exposed to the script: {}", err),
            );
            return RunResult::failed(request_id, id_counter, error, Vec::new());
        }

        let api = AgentApi { session: Rc::clone(&self.session) };
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);

        self.deadline.set(Some(
            Instant::now() + Duration::from_millis(self.limits.max_execution_time_ms),
        ));
        self.heap_floor.set(Some(meter::live_bytes()));
        let outcome =
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &ast, TICK_HANDLER, (api,));
        self.heap_floor.set(None);
        self.deadline.set(None);

        let session = std::mem::take(&mut *self.session.borrow_mut());

        if let Err(err) = outcome {
            let error = classify(&err, &self.limits);
            debug!("run {} failed: {}", request_id, error);
            return RunResult::failed(request_id, id_counter, error, session.logs);
        }

        let final_state = match rhai::serde::from_dynamic::<serde_json::Value>(&Dynamic::from_map(
            session.state,
        )) {
            Ok(state) => state,
            Err(err) => {
                let error = ScriptError::new(
                    ErrorKind::Runtime,
                    format!("persistent state is not serializable: {}", err),
                );
                return RunResult::failed(request_id, id_counter, error, session.logs);
            }
        };

        let state_bytes = serde_json::to_vec(&final_state).map(|b| b.len()).unwrap_or(usize::MAX);
        if state_bytes as u64 > self.limits.max_memory_bytes {
            let error = ScriptError::new(
                ErrorKind::Resource,
                format!(
                    "persistent state is {} bytes, limit is {}",
                    state_bytes, self.limits.max_memory_bytes
                ),
            );
            return RunResult::failed(request_id, id_counter, error, session.logs);
        }

        RunResult {
            request_id,
            success: true,
            error: None,
            id_counter: session.id_counter,
            logs: session.logs,
            ops: session.ops,
            final_state: Some(final_state),
        }
    }

    fn compile(&mut self, code: &str) -> Result<AST, ScriptError> {
        if let Some((source, ast)) = &self.compiled {
            if source == code {
                return Ok(ast.clone());
            }
        }

        let ast = self.engine.compile(code).map_err(|err| parse_error(&err))?;
        debug!("compiled agent script ({} bytes)", code.len());
        self.compiled = Some((code.to_string(), ast.clone()));
        Ok(ast)
    }
}

fn build_engine(
    limits: &SandboxLimits,
    session: Rc<RefCell<TickSession>>,
    deadline: Rc<Cell<Option<Instant>>>,
    heap_floor: Rc<Cell<Option<isize>>>,
    abort: Arc<AtomicBool>,
) -> Engine {
    let mut engine = Engine::new_raw();

    // Pure packages only; scripts see time solely through `api.now`.
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());
    engine.register_global_module(MoreStringPackage::new().as_shared_module());
    engine.disable_symbol("eval");

    let call_levels = (limits.max_stack_size_bytes / FRAME_BYTES).clamp(4, 64) as usize;
    let expr_depth = (call_levels * 2).clamp(16, 128);
    engine.set_max_call_levels(call_levels);
    engine.set_max_expr_depths(expr_depth, expr_depth / 2);

    let memory = usize::try_from(limits.max_memory_bytes).unwrap_or(usize::MAX).max(64);
    engine.set_max_string_size(memory);
    engine.set_max_array_size(memory / 16);
    engine.set_max_map_size(memory / 32);
    if let Some(max_operations) = limits.max_operations {
        engine.set_max_operations(max_operations);
    }

    // Per-value caps above bound a single allocation; this bounds the total.
    let heap_budget = isize::try_from(limits.max_memory_bytes).unwrap_or(isize::MAX);
    engine.on_progress(move |ops| {
        if let Some(floor) = heap_floor.get() {
            if meter::live_bytes().saturating_sub(floor) > heap_budget {
                return Some(Dynamic::from(OUT_OF_MEMORY.to_string()));
            }
        }
        if ops % PROGRESS_CHECK_INTERVAL != 0 {
            return None;
        }
        if abort.load(Ordering::Relaxed) {
            return Some(Dynamic::from(ABORTED.to_string()));
        }
        match deadline.get() {
            Some(at) if Instant::now() >= at => Some(Dynamic::from(TIMED_OUT.to_string())),
            _ => None,
        }
    });

    engine.on_print(move |text| session.borrow_mut().logs.push(LogEntry::info(text)));

    engine
        .register_type_with_name::<AgentApi>("AgentApi")
        .register_get("agent", |api: &mut AgentApi| api.session.borrow().agent.clone())
        .register_get("now", |api: &mut AgentApi| api.session.borrow().now)
        .register_get("incoming", |api: &mut AgentApi| api.session.borrow().incoming.clone())
        .register_get("transactions", |api: &mut AgentApi| {
            api.session.borrow().outgoing.clone()
        })
        .register_get_set(
            "state",
            |api: &mut AgentApi| api.session.borrow().state.clone(),
            |api: &mut AgentApi, state: Map| api.session.borrow_mut().state = state,
        )
        .register_fn("log", |api: &mut AgentApi, message: Dynamic| {
            api.log(LogEntry::info(message.to_string()))
        })
        .register_fn("warn", |api: &mut AgentApi, message: Dynamic| {
            api.log(LogEntry::warn(message.to_string()))
        })
        .register_fn("create_transaction", AgentApi::create_transaction)
        .register_fn("transition_state", AgentApi::transition_state)
        .register_fn("release_escrow", AgentApi::release_escrow)
        .register_fn("cancel", AgentApi::cancel)
        .register_fn("dispute", AgentApi::dispute)
        .register_fn("dispute", |api: &mut AgentApi, tx: INT| api.dispute(tx, ""))
        .register_fn("submit_job", AgentApi::submit_job);

    engine
}

fn to_line_column(position: Position) -> (Option<u32>, Option<u32>) {
    (
        position.line().and_then(|l| u32::try_from(l).ok()),
        position.position().and_then(|c| u32::try_from(c).ok()),
    )
}

fn parse_error(err: &ParseError) -> ScriptError {
    let kind = match err.0.as_ref() {
        ParseErrorType::ExprTooDeep => ErrorKind::Resource,
        _ => ErrorKind::Syntax,
    };
    let (line, column) = to_line_column(err.1);
    ScriptError::new(kind, err.0.to_string()).at(line, column)
}

/// Unwraps errors raised inside nested script function calls.
fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        _ => err,
    }
}

/// Maps an interpreter error onto the sandbox error taxonomy.
fn classify(err: &EvalAltResult, limits: &SandboxLimits) -> ScriptError {
    let root = root_cause(err);
    let (line, column) = to_line_column(root.position());

    let (kind, message) = match root {
        EvalAltResult::ErrorTerminated(token, _) if token.to_string() == ABORTED => {
            (ErrorKind::Timeout, "run aborted by host".to_string())
        }
        EvalAltResult::ErrorTerminated(token, _) if token.to_string() == OUT_OF_MEMORY => (
            ErrorKind::Resource,
            format!("script holds more than {} bytes", limits.max_memory_bytes),
        ),
        EvalAltResult::ErrorTerminated(..) => (
            ErrorKind::Timeout,
            format!("execution exceeded {}ms", limits.max_execution_time_ms),
        ),
        EvalAltResult::ErrorTooManyOperations(_) => (
            ErrorKind::Resource,
            format!(
                "operation budget of {} exhausted",
                limits.max_operations.unwrap_or_default()
            ),
        ),
        EvalAltResult::ErrorStackOverflow(_) => (
            ErrorKind::Resource,
            format!("call depth exceeds {} byte stack limit", limits.max_stack_size_bytes),
        ),
        EvalAltResult::ErrorDataTooLarge(what, _) => {
            (ErrorKind::Resource, format!("{} exceeds memory limit", what))
        }
        EvalAltResult::ErrorTooManyModules(_) => {
            (ErrorKind::Resource, "too many modules loaded".to_string())
        }
        EvalAltResult::ErrorParsing(kind, _) => (ErrorKind::Syntax, kind.to_string()),
        EvalAltResult::ErrorRuntime(value, _) => (ErrorKind::Runtime, value.to_string()),
        other => (ErrorKind::Runtime, other.to_string()),
    };

    ScriptError::new(kind, message).at(line, column)
}
