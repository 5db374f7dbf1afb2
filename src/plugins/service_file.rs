//! Service-file loader
//!
//! A service `a/b` is described by the executable `<script_dir>/a`. The loader
//! runs it as `<file> internal_setup` with a socket pair on fd 3; the script
//! answers with protocol requests (create, set variables, done) while the
//! service sits in PARSING. The same requests are accepted on the control
//! socket.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use nix::sys::signal::Signal;

use crate::engine::{
    kind, DataKind, Engine, EngineError, Event, HookResult, PipeDirection, PipeSpec, ProcessId, ProcessSpec,
    ProcessType, ServiceId, ServiceType, Severity, StateClass, StateDescriptor, DEFAULT_PRIORITY,
};
use crate::engine::hooks::{NewActive, PipeOutput};
use crate::protocol::{self, ProtocolError, Reply, Request, RequestBody, SETUP_FD};

pub const PARSING: &str = "PARSING";
pub const REDY_TO_START: &str = "REDY_TO_START";
pub const PARSE_FAIL: &str = "PARSE_FAIL";
pub const PARSE_PROCESS: &str = "parse-process";
pub const UNSET: &str = "unset";

/// Runs before general pipe subscribers so setup traffic is claimed first
const PIPE_PRIORITY: i32 = 30;

pub fn register(engine: &mut Engine) {
    engine.states_mut().register(
        StateDescriptor::new(PARSING, "This service is being parsed by service_file", StateClass::Starting)
            .transient()
            .on_alarm(|engine, id| {
                let msg = format!("Parsing {} timed out", name(engine, id));
                engine.report(Severity::Warn, &msg);
                engine.kill_service_processes(id, Signal::SIGKILL);
                mark_or_report(engine, id, PARSE_FAIL);
            }),
    );
    engine.states_mut().register(StateDescriptor::new(
        REDY_TO_START,
        "This service is finished loading",
        StateClass::Down,
    ));
    engine.states_mut().register(StateDescriptor::new(
        PARSE_FAIL,
        "This parse process failed",
        StateClass::Failed,
    ));

    engine.register_process_type(ProcessType::new(PARSE_PROCESS).on_exit(parse_process_exited));
    engine
        .service_types_mut()
        .register(ServiceType::new(UNSET, "Service type is not set yet, still parsing").hidden());

    engine.register_hook::<kind::NewActive, _>("service_file", DEFAULT_PRIORITY, new_active);
    engine.register_hook::<kind::PipeWatcher, _>("service_file", PIPE_PRIORITY, setup_pipe);
}

fn name(engine: &Engine, id: ServiceId) -> String {
    engine.service_name(id).unwrap_or("?").to_string()
}

fn mark_or_report(engine: &mut Engine, id: ServiceId, state: &str) {
    if let Err(e) = engine.mark_service_named(id, state) {
        let msg = format!("Could not mark {} {}: {}", name(engine, id), state, e);
        engine.report(Severity::Fail, &msg);
    }
}

fn is_parsing(engine: &Engine, id: ServiceId) -> bool {
    engine.state_name(id) == Some(PARSING)
}

/// Script that describes `name`: the part before the first `/`
pub fn script_for(engine: &Engine, name: &str) -> PathBuf {
    let base = name.split('/').next().unwrap_or(name);
    engine.config().script_dir.join(base)
}

/// Create `name` in PARSING and launch its setup script
pub fn load_service(engine: &mut Engine, name: &str) -> Result<ServiceId, EngineError> {
    let file = script_for(engine, name);
    let invalid = |reason: String| EngineError::InvalidTransition {
        service: name.to_string(),
        action: "load",
        reason,
    };

    let meta = std::fs::metadata(&file).map_err(|_| EngineError::NotFound(format!("File \"{}\"", file.display())))?;
    if !meta.is_file() {
        return Err(invalid(format!("\"{}\" is not a regular file", file.display())));
    }
    if meta.permissions().mode() & 0o100 == 0 {
        return Err(invalid(format!("\"{}\" can't be executed", file.display())));
    }

    let parsing = engine.state(PARSING)?;
    let unset = engine.service_types().find(UNSET);
    let file = file.to_string_lossy().into_owned();
    let id = engine.create_service(name, parsing, unset, Some(&file))?;

    let ptype = engine
        .find_process_type(PARSE_PROCESS)
        .ok_or_else(|| EngineError::NotFound(format!("Process type \"{}\"", PARSE_PROCESS)))?;
    let spec = ProcessSpec::new(vec![file, "internal_setup".to_string()])
        .pipe(PipeSpec::new(PipeDirection::Both, &[SETUP_FD]));

    if let Err(e) = engine.spawn_bound(id, ptype, spec) {
        mark_or_report(engine, id, PARSE_FAIL);
        return Err(e);
    }
    // Records are created straight into PARSING, so arm its alarm here
    let timeout = engine.config().parse_timeout;
    engine.set_alarm(id, timeout);
    Ok(id)
}

fn new_active(engine: &mut Engine, event: &mut Event<NewActive>) -> HookResult {
    if event.payload.service.is_some() {
        return Ok(());
    }
    let name = event.payload.name.clone();
    match load_service(engine, &name) {
        Ok(id) => {
            event.payload.service = Some(id);
            event.mark_handled();
        }
        Err(e) => engine.report(Severity::Warn, &format!("Can't load {}: {}", name, e)),
    }
    Ok(())
}

fn parse_process_exited(engine: &mut Engine, id: ServiceId, process: ProcessId) {
    let status = engine.processes().get(process).and_then(|p| p.exit);
    engine.free_process(process);

    let success = status.is_some_and(|s| s.success());
    if !is_parsing(engine, id) {
        if !success {
            log::warn!("Parse process of {} ended with {:?}", name(engine, id), status);
        }
        return;
    }

    if success {
        // A clean exit finishes the description like a Done request would
        let service = name(engine, id);
        let reply = done(engine, &service);
        if reply.success || !is_parsing(engine, id) {
            return;
        }
        engine.report(Severity::Warn, &format!("Can't start {}: {}", service, reply.message));
    } else {
        let msg = format!("Parsing {} failed: {:?}", name(engine, id), status);
        engine.report(Severity::Warn, &msg);
    }
    mark_or_report(engine, id, PARSE_FAIL);
}

/// PIPE_WATCHER: requests from a setup script on its fd 3
fn setup_pipe(engine: &mut Engine, event: &mut Event<PipeOutput>) -> HookResult {
    if event.is_handled() {
        return Ok(());
    }
    let PipeOutput { process, pipe, .. } = event.payload;
    if engine.process_type_name(process) != Some(PARSE_PROCESS) {
        return Ok(());
    }

    let mut buffer = match engine.processes_mut().get_mut(process).and_then(|p| p.pipes.get_mut(pipe)) {
        Some(p) if p.direction == PipeDirection::Both && p.targets_fd(SETUP_FD) => std::mem::take(&mut p.buffer),
        _ => return Ok(()),
    };
    event.mark_handled();

    let mut replies = Vec::new();
    loop {
        let request = match protocol::take_frame::<Request>(&mut buffer) {
            Ok(Some(request)) => Ok(request),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        replies.push(answer(engine, request));
    }

    let Some(p) = engine.processes_mut().get_mut(process).and_then(|p| p.pipes.get_mut(pipe)) else {
        return Ok(());
    };
    p.buffer = buffer;
    for reply in replies {
        let frame = protocol::encode(&reply).map_err(|e| std::io::Error::other(e.to_string()))?;
        p.send(&frame)?;
    }
    Ok(())
}

/// Reply to one decoded (or undecodable) request
pub fn answer(engine: &mut Engine, request: Result<Request, ProtocolError>) -> Reply {
    let request = match request.and_then(|r| protocol::check_version(&r).map(|_| r)) {
        Ok(r) => r,
        Err(ProtocolError::Version { found, .. }) => {
            log::warn!("Request with protocol version {}", found);
            return Reply::fail("Bad protocol version");
        }
        Err(e) => {
            log::warn!("Could not read incoming service_file request: {}", e);
            return Reply::fail("Unable to read request");
        }
    };
    handle_request(engine, request.body)
}

pub fn handle_request(engine: &mut Engine, body: RequestBody) -> Reply {
    log::debug!("service_file request: {:?}", body);
    match body {
        RequestBody::CreateService {
            service_type,
            name,
            origin,
        } => create_service(engine, &service_type, &name, &origin),
        RequestBody::SetVariable {
            service,
            var_type,
            var_name,
            value,
        } => set_variable(engine, &service, &var_type, non_empty(var_name), non_empty(value)),
        RequestBody::GetVariable {
            service,
            var_type,
            var_name,
        } => get_variable(engine, &service, &var_type, non_empty(var_name)),
        RequestBody::Done { service } => done(engine, &service),
        RequestBody::Abort { service } => abort(engine, &service),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn create_service(engine: &mut Engine, service_type: &str, name: &str, origin: &str) -> Reply {
    let Some(ty) = engine.service_types().find(service_type) else {
        return Reply::fail(format!("Unable to find servicetype \"{}\".", service_type));
    };
    let parsing = match engine.state(PARSING) {
        Ok(s) => s,
        Err(e) => return Reply::fail(e.to_string()),
    };

    match engine.create_service(name, parsing, Some(ty), Some(origin)) {
        Ok(_) => Reply::ok(),
        Err(EngineError::Duplicate(_)) => Reply::fail("Duplet found."),
        Err(e) => Reply::fail(e.to_string()),
    }
}

fn set_variable(
    engine: &mut Engine,
    service: &str,
    var_type: &str,
    var_name: Option<String>,
    value: Option<String>,
) -> Reply {
    if service.is_empty() {
        return Reply::fail("Service missing.");
    }
    if var_type.is_empty() {
        return Reply::fail("Vartype missing.");
    }
    let Some(id) = engine.find_service(service) else {
        return Reply::fail(format!("Service \"{}\" not found.", service));
    };
    if !is_parsing(engine, id) {
        return Reply::fail("Please dont edit finished services.");
    }
    let Some(ty) = engine.find_data_type(var_type) else {
        return Reply::fail(format!("Variable entry \"{}\" not found.", var_type));
    };
    if value.is_none() && ty.kind != DataKind::Set {
        return Reply::fail("Value missing.");
    }

    let var = var_name.as_deref();
    let value = value.unwrap_or_default();
    let Some(record) = engine.services_mut().get_mut(id) else {
        return Reply::fail("Service not found.");
    };
    let data = &mut record.data;

    let result = match ty.kind {
        DataKind::String => data.set_string(&ty, var, value),
        DataKind::StringList => {
            let words: Vec<&str> = value.split_whitespace().collect();
            if words.is_empty() {
                return Reply::fail("Value missing.");
            }
            words.into_iter().try_for_each(|word| data.set_string(&ty, var, word))
        }
        DataKind::Set => data.set_flag(&ty, var),
        DataKind::Int => match value.trim().parse::<i32>() {
            Ok(n) => data.set_int(&ty, var, n),
            Err(_) => return Reply::fail(format!("Value \"{}\" is not a number.", value)),
        },
    };

    match result {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::fail(e.to_string()),
    }
}

fn get_variable(engine: &mut Engine, service: &str, var_type: &str, var_name: Option<String>) -> Reply {
    if service.is_empty() || var_type.is_empty() {
        return Reply::fail("Variables missing.");
    }
    let Some(record) = engine.find_service(service).and_then(|id| engine.services().get(id)) else {
        return Reply::fail(format!("Service \"{}\" not found.", service));
    };
    let Some(ty) = engine.find_data_type(var_type) else {
        return Reply::fail("Variable entry not found.");
    };

    let var = var_name.as_deref();
    let data = &record.data;
    match ty.kind {
        DataKind::String => match data.get_string(&ty, var) {
            Some(s) => Reply::ok_with(s),
            None => Reply::fail("Variable not set."),
        },
        DataKind::StringList => Reply::ok_with(data.strings(&ty, var).collect::<Vec<_>>().join(" ")),
        DataKind::Set => Reply {
            success: data.is_set(&ty, var),
            message: String::new(),
        },
        DataKind::Int => Reply::ok_with(data.get_int(&ty, var).unwrap_or(0).to_string()),
    }
}

fn done(engine: &mut Engine, service: &str) -> Reply {
    let Some(id) = engine.find_service(service) else {
        return Reply::fail("Service not found.");
    };

    let typed = engine
        .services()
        .get(id)
        .and_then(|s| s.service_type)
        .and_then(|t| engine.service_types().get(t))
        .is_some_and(|t| t.name != UNSET);
    if !typed {
        return Reply::fail("Type not set, please run iregister type service");
    }
    if !is_parsing(engine, id) {
        return Reply::fail("Service is not in PARSING state, cant start.");
    }

    if let Err(e) = engine.mark_service_named(id, REDY_TO_START) {
        return Reply::fail(e.to_string());
    }
    match engine.start_service(id) {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::fail(e.to_string()),
    }
}

fn abort(engine: &mut Engine, service: &str) -> Reply {
    let Some(id) = engine.find_service(service) else {
        return Reply::fail("Service not found.");
    };
    if !is_parsing(engine, id) {
        return Reply::fail("Service is not in PARSING state, cant abort.");
    }

    match engine.mark_service_named(id, PARSE_FAIL) {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::fail(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{ExitStatus, RecordingLauncher};
    use crate::plugins::service_types;

    fn engine() -> (Engine, RecordingLauncher) {
        let launcher = RecordingLauncher::new();
        let mut engine = Engine::new(Config::default(), Box::new(launcher.clone()));
        service_types::register(&mut engine);
        register(&mut engine);
        (engine, launcher)
    }

    fn create(engine: &mut Engine, ty: &str, name: &str) -> Reply {
        handle_request(
            engine,
            RequestBody::CreateService {
                service_type: ty.into(),
                name: name.into(),
                origin: "/etc/initng/getty".into(),
            },
        )
    }

    fn set(engine: &mut Engine, service: &str, var_type: &str, value: Option<&str>) -> Reply {
        handle_request(
            engine,
            RequestBody::SetVariable {
                service: service.into(),
                var_type: var_type.into(),
                var_name: None,
                value: value.map(str::to_string),
            },
        )
    }

    fn get(engine: &mut Engine, service: &str, var_type: &str) -> Reply {
        handle_request(
            engine,
            RequestBody::GetVariable {
                service: service.into(),
                var_type: var_type.into(),
                var_name: None,
            },
        )
    }

    #[test]
    fn test_unknown_service_type() {
        let (mut engine, _) = engine();
        let reply = create(&mut engine, "bogus", "x");
        assert_eq!(reply, Reply::fail("Unable to find servicetype \"bogus\"."));
    }

    #[test]
    fn test_set_variable_errors() {
        let (mut engine, _) = engine();
        assert_eq!(set(&mut engine, "", "exec", Some("x")).message, "Service missing.");
        assert_eq!(set(&mut engine, "a", "", Some("x")).message, "Vartype missing.");
        assert_eq!(set(&mut engine, "a", "exec", Some("x")).message, "Service \"a\" not found.");

        assert!(create(&mut engine, "service", "a").success);
        assert_eq!(
            set(&mut engine, "a", "nope", Some("x")).message,
            "Variable entry \"nope\" not found."
        );
        assert_eq!(set(&mut engine, "a", "exec", None).message, "Value missing.");
        assert_eq!(set(&mut engine, "a", "exec", Some("")).message, "Value missing.");
        assert!(!set(&mut engine, "a", "timeout", Some("soon")).success);
    }

    #[test]
    fn test_set_and_get_variables() {
        let (mut engine, _) = engine();
        assert!(create(&mut engine, "daemon", "daemon/sshd").success);

        assert!(set(&mut engine, "daemon/sshd", "exec", Some("/usr/sbin/sshd")).success);
        assert!(set(&mut engine, "daemon/sshd", "exec_args", Some("-D  -e")).success);
        assert!(set(&mut engine, "daemon/sshd", "exec_args", Some("-4")).success);
        assert!(set(&mut engine, "daemon/sshd", "respawn", None).success);
        assert!(set(&mut engine, "daemon/sshd", "timeout", Some("15")).success);

        assert_eq!(get(&mut engine, "daemon/sshd", "exec").message, "/usr/sbin/sshd");
        assert_eq!(get(&mut engine, "daemon/sshd", "exec_args").message, "-D -e -4");
        assert!(get(&mut engine, "daemon/sshd", "respawn").success);
        assert_eq!(get(&mut engine, "daemon/sshd", "timeout").message, "15");
        assert_eq!(get(&mut engine, "", "exec").message, "Variables missing.");
        assert_eq!(get(&mut engine, "daemon/sshd", "nope").message, "Variable entry not found.");

        let keyed = handle_request(
            &mut engine,
            RequestBody::SetVariable {
                service: "daemon/sshd".into(),
                var_type: "env".into(),
                var_name: Some("LANG".into()),
                value: Some("C".into()),
            },
        );
        assert!(keyed.success);
        let reply = handle_request(
            &mut engine,
            RequestBody::GetVariable {
                service: "daemon/sshd".into(),
                var_type: "env".into(),
                var_name: Some("LANG".into()),
            },
        );
        assert_eq!(reply.message, "C");
    }

    #[test]
    fn test_blank_list_value_is_missing() {
        let (mut engine, _) = engine();
        assert!(create(&mut engine, "daemon", "daemon/cron").success);

        assert_eq!(set(&mut engine, "daemon/cron", "exec_args", Some("  \t ")).message, "Value missing.");
        assert!(!set(&mut engine, "daemon/cron", "exec_args", Some(" \n")).success);
        assert_eq!(get(&mut engine, "daemon/cron", "exec_args").message, "");

        assert!(set(&mut engine, "daemon/cron", "exec_args", Some(" -f ")).success);
        assert_eq!(get(&mut engine, "daemon/cron", "exec_args").message, "-f");
    }

    #[test]
    fn test_done_requires_type_and_parsing() {
        let (mut engine, _) = engine();
        assert!(create(&mut engine, UNSET, "x").success);
        let reply = handle_request(&mut engine, RequestBody::Done { service: "x".into() });
        assert_eq!(reply.message, "Type not set, please run iregister type service");

        let reply = handle_request(&mut engine, RequestBody::Done { service: "y".into() });
        assert_eq!(reply.message, "Service not found.");
    }

    #[test]
    fn test_abort_marks_parse_fail() {
        let (mut engine, _) = engine();
        assert!(create(&mut engine, "service", "x").success);
        assert!(handle_request(&mut engine, RequestBody::Abort { service: "x".into() }).success);
        let id = engine.find_service("x").unwrap();
        assert_eq!(engine.state_name(id), Some(PARSE_FAIL));

        let reply = handle_request(&mut engine, RequestBody::Abort { service: "x".into() });
        assert_eq!(reply.message, "Service is not in PARSING state, cant abort.");
        assert_eq!(
            set(&mut engine, "x", "exec", Some("/bin/true")).message,
            "Please dont edit finished services."
        );
    }

    #[test]
    fn test_answer_rejects_bad_requests() {
        let (mut engine, _) = engine();
        let mut request = Request::new(RequestBody::Done { service: "x".into() });
        request.version = 99;
        assert_eq!(answer(&mut engine, Ok(request)).message, "Bad protocol version");

        let mut garbage = vec![0, 0, 0, 1, 0xc1];
        let decoded = protocol::take_frame::<Request>(&mut garbage);
        let decoded = decoded.and_then(|r| r.ok_or_else(|| ProtocolError::FrameTooLarge(0)));
        assert_eq!(answer(&mut engine, decoded).message, "Unable to read request");
    }

    #[test]
    fn test_parse_exit_code() {
        let (mut engine, launcher) = engine();
        let parsing = engine.state(PARSING).unwrap();
        let ptype = engine.find_process_type(PARSE_PROCESS).unwrap();
        let id = engine.create_service("getty/tty1", parsing, None, None).unwrap();
        engine
            .spawn_bound(id, ptype, ProcessSpec::new(vec!["/etc/initng/getty".into()]))
            .unwrap();

        engine.process_exited(launcher.last_pid().unwrap(), ExitStatus::Exited(1));
        assert_eq!(engine.state_name(id), Some(PARSE_FAIL));
        assert!(engine.processes().is_empty());
    }

    #[test]
    fn test_clean_parse_exit_starts_service() {
        let (mut engine, launcher) = engine();
        let parsing = engine.state(PARSING).unwrap();
        let ptype = engine.find_process_type(PARSE_PROCESS).unwrap();
        let virtual_type = engine.service_types().find("virtual");
        let typed = engine.create_service("net/lo", parsing, virtual_type, None).unwrap();
        let untyped = engine.create_service("net/eth0", parsing, None, None).unwrap();

        for id in [typed, untyped] {
            engine
                .spawn_bound(id, ptype, ProcessSpec::new(vec!["/etc/initng/net".into()]))
                .unwrap();
            engine.process_exited(launcher.last_pid().unwrap(), ExitStatus::Exited(0));
        }

        assert_eq!(engine.class_of(typed), Some(StateClass::Up));
        assert_eq!(engine.state_name(untyped), Some(PARSE_FAIL));
    }

    #[test]
    fn test_script_for() {
        let (engine, _) = engine();
        assert_eq!(script_for(&engine, "getty/tty1"), PathBuf::from("/etc/initng/getty"));
        assert_eq!(script_for(&engine, "sshd"), PathBuf::from("/etc/initng/sshd"));
    }
}
