#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use vcomputer::{
    guest::{ApiResult, CoroutineId, FunctionId, GuestApi, GuestError, GuestRuntime, Resumed},
    MemoryMount, Mount, RuntimeLimits, Value,
};

#[ctor::ctor]
fn init() {
    vcomputer::logging::init("debug");
}

/// What every scripted runtime built by one factory did.
#[derive(Clone, Default)]
pub struct Recorder {
    pub resumes: Rc<RefCell<Vec<Vec<Value>>>>,
    pub loaded: Rc<RefCell<Vec<String>>>,
    pub globals: Rc<RefCell<Vec<String>>>,
    pub preloads: Rc<RefCell<Vec<String>>>,
    pub returns: Rc<RefCell<Vec<Vec<Value>>>>,
    pub collections: Rc<Cell<u32>>,
    pub created: Rc<Cell<u32>>,
    pub dropped: Rc<Cell<u32>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.borrow().len()
    }

    pub fn last_resume(&self) -> Vec<Value> {
        self.resumes.borrow().last().cloned().unwrap_or_default()
    }

    pub fn live_runtimes(&self) -> u32 {
        self.created.get() - self.dropped.get()
    }

    pub fn factory(&self) -> impl Fn(RuntimeLimits) -> Box<dyn GuestRuntime> {
        let recorder = self.clone();
        move |_limits| {
            recorder.created.set(recorder.created.get() + 1);
            Box::new(ScriptedRuntime::new(recorder.clone())) as Box<dyn GuestRuntime>
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Yield(Vec<Value>),
    Return(Vec<Value>),
    Os(&'static str, Vec<Value>),
    Error(String),
    Loop,
    Call(String, String, Vec<Value>),
}

fn literal(word: &str) -> Value {
    if let Ok(i) = word.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(n) = word.parse::<f64>() {
        Value::Number(n)
    } else if word == "nil" {
        Value::Nil
    } else if word == "true" {
        Value::Boolean(true)
    } else {
        Value::from(word)
    }
}

fn parse(chunk: &str, source: &[u8]) -> Result<Vec<Op>, GuestError> {
    let text = String::from_utf8_lossy(source);
    let mut ops = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };
        let rest: Vec<&str> = words.collect();
        let values = || rest.iter().map(|w| literal(w)).collect::<Vec<_>>();
        let op = match keyword {
            "yield" => Op::Yield(values()),
            "return" => Op::Return(values()),
            "halt" => Op::Os("halt", vec![]),
            "reboot" => Op::Os("reboot", vec![]),
            "shutdown" => Op::Os("shutdown", vec![]),
            "status" => Op::Os("getStatus", vec![]),
            "boot" => Op::Os("boot", values()),
            "error" => Op::Error(rest.join(" ")),
            "loop" => Op::Loop,
            "call" if rest.len() >= 2 => Op::Call(
                rest[0].to_string(),
                rest[1].to_string(),
                rest[2..].iter().map(|w| literal(w)).collect(),
            ),
            other => {
                return Err(GuestError::Syntax(format!(
                    "{}:{}: unexpected '{}'",
                    chunk,
                    line_no + 1,
                    other
                )))
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

/// A line-oriented stand-in for the real interpreter.
///
/// ```text
/// yield timer key     -- suspend with the given values
/// return              -- finish the program
/// halt | reboot | shutdown | status | boot <device>
/// error <message>     -- raise a runtime error
/// loop                -- jump back to the first line
/// call <api> <fn> ... -- call a global or preloaded api
/// ```
pub struct ScriptedRuntime {
    recorder: Recorder,
    functions: Vec<Vec<Op>>,
    coroutines: Vec<(usize, usize)>,
    globals: HashMap<String, Value>,
    preloads: HashMap<String, Rc<dyn GuestApi>>,
}

impl ScriptedRuntime {
    fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            functions: Vec::new(),
            coroutines: Vec::new(),
            globals: HashMap::new(),
            preloads: HashMap::new(),
        }
    }

    fn api(&self, name: &str) -> Result<Rc<dyn GuestApi>, GuestError> {
        if let Some(Value::Api(api)) = self.globals.get(name) {
            return Ok(api.clone());
        }
        self.preloads
            .get(name)
            .cloned()
            .ok_or_else(|| GuestError::Runtime(format!("module '{}' not found", name)))
    }
}

impl ScriptedRuntime {
    /// Runs a host call; `Some` means the coroutine stops here.
    fn call(
        &self,
        api: &str,
        function: &str,
        args: &[Value],
    ) -> Option<Result<Resumed, GuestError>> {
        match self.api(api).and_then(|a| a.call(function, args)) {
            Ok(ApiResult::Yield(values)) => Some(Ok(Resumed::Yielded(values))),
            Ok(ApiResult::Return(values)) => {
                self.recorder.returns.borrow_mut().push(values);
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for ScriptedRuntime {
    fn drop(&mut self) {
        self.recorder.dropped.set(self.recorder.dropped.get() + 1);
    }
}

impl GuestRuntime for ScriptedRuntime {
    fn load(&mut self, chunk_name: &str, source: &[u8]) -> Result<FunctionId, GuestError> {
        let ops = parse(chunk_name, source)?;
        self.recorder
            .loaded
            .borrow_mut()
            .push(String::from_utf8_lossy(source).into_owned());
        self.functions.push(ops);
        Ok(FunctionId(self.functions.len() as u32 - 1))
    }

    fn create_coroutine(&mut self, function: FunctionId) -> Result<CoroutineId, GuestError> {
        self.coroutines.push((function.0 as usize, 0));
        Ok(CoroutineId(self.coroutines.len() as u32 - 1))
    }

    fn resume(&mut self, coroutine: CoroutineId, args: Vec<Value>) -> Result<Resumed, GuestError> {
        self.recorder.resumes.borrow_mut().push(args);
        let (function, mut pc) = self.coroutines[coroutine.0 as usize];
        let ops = self.functions[function].clone();
        let mut jumps = 0;

        let result = loop {
            let Some(op) = ops.get(pc) else {
                break Ok(Resumed::Finished(vec![]));
            };
            pc += 1;
            match op {
                Op::Yield(values) => break Ok(Resumed::Yielded(values.clone())),
                Op::Return(values) => break Ok(Resumed::Finished(values.clone())),
                Op::Error(message) => break Err(GuestError::Runtime(message.clone())),
                Op::Loop => {
                    jumps += 1;
                    if jumps > 1 {
                        break Err(GuestError::Timeout);
                    }
                    pc = 0;
                }
                Op::Os(function, args) => {
                    if let Some(result) = self.call("os", function, args) {
                        break result;
                    }
                }
                Op::Call(api, function, args) => {
                    if let Some(result) = self.call(api, function, args) {
                        break result;
                    }
                }
            }
        };

        self.coroutines[coroutine.0 as usize].1 = pc;
        result
    }

    fn set_global(&mut self, name: &str, value: Value) {
        self.recorder.globals.borrow_mut().push(name.to_string());
        self.globals.insert(name.to_string(), value);
    }

    fn set_preload(&mut self, name: &str, api: Rc<dyn GuestApi>) {
        self.recorder.preloads.borrow_mut().push(name.to_string());
        self.preloads.insert(name.to_string(), api);
    }

    fn collect_garbage(&mut self) {
        self.recorder
            .collections
            .set(self.recorder.collections.get() + 1);
    }
}

/// A read-only ROM holding only `boot.lua`.
pub fn rom(boot: &str) -> Rc<dyn Mount> {
    Rc::new(MemoryMount::new().with_file("boot.lua", boot).into_read_only())
}
