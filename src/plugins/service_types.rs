//! Built-in service types, their states and variables
//!
//! `virtual` services have nothing to run, `service` runs one command to
//! completion, `daemon` keeps one command running.

use nix::sys::signal::Signal;

use crate::engine::{
    DataKind, DataType, Engine, EngineError, PipeDirection, PipeSpec, ProcessId, ProcessSpec, ProcessType,
    ServiceId, ServiceType, Severity, StateClass, StateDescriptor, SystemState,
};

pub const START_RUNNING: &str = "START_RUNNING";
pub const RUNNING: &str = "RUNNING";
pub const DONE: &str = "DONE";
pub const STOP_RUNNING: &str = "STOP_RUNNING";
pub const STOPPED: &str = "STOPPED";
pub const START_FAILED: &str = "START_FAILED";

pub const START_PROCESS: &str = "start-process";
pub const DAEMON_PROCESS: &str = "daemon-process";

pub const EXEC: DataType = DataType::new("exec", DataKind::String, "Command line to run");
pub const EXEC_ARGS: DataType = DataType::new("exec_args", DataKind::StringList, "Extra arguments to exec");
pub const DESCRIPTION: DataType = DataType::new("description", DataKind::String, "What the service does");
pub const ENV: DataType = DataType::keyed("env", DataKind::String, "Environment variable for the child");
pub const RESPAWN: DataType = DataType::new("respawn", DataKind::Set, "Restart the daemon when it dies");
pub const TIMEOUT: DataType = DataType::new("timeout", DataKind::Int, "Seconds a start may take");

pub fn register(engine: &mut Engine) {
    for data_type in [EXEC, EXEC_ARGS, DESCRIPTION, ENV, RESPAWN, TIMEOUT] {
        engine.register_data_type(data_type);
    }

    let states = engine.states_mut();
    states.register(
        StateDescriptor::new(START_RUNNING, "The service is starting", StateClass::Starting)
            .on_init(arm_start_timeout)
            .on_alarm(start_timed_out),
    );
    states.register(StateDescriptor::new(RUNNING, "The daemon is running", StateClass::Up));
    states.register(StateDescriptor::new(DONE, "The service has started", StateClass::Up));
    states.register(
        StateDescriptor::new(STOP_RUNNING, "The service is stopping", StateClass::Stopping)
            .on_init(|engine, id| {
                let after = engine.config().stop_timeout;
                engine.set_alarm(id, after);
            })
            .on_alarm(|engine, id| {
                log::warn!("{} did not stop in time, killing it", name(engine, id));
                engine.kill_service_processes(id, Signal::SIGKILL);
            }),
    );
    states.register(StateDescriptor::new(STOPPED, "The service is stopped", StateClass::Down));
    states.register(StateDescriptor::new(START_FAILED, "The service failed to start", StateClass::Failed));

    engine.register_process_type(ProcessType::new(START_PROCESS).on_exit(start_process_exited));
    engine.register_process_type(ProcessType::new(DAEMON_PROCESS).on_exit(daemon_process_exited));

    let types = engine.service_types_mut();
    types.register(
        ServiceType::new("virtual", "Groups other services, runs nothing")
            .on_start(|engine, id| engine.mark_service_named(id, DONE))
            .on_stop(|engine, id| engine.mark_service_named(id, STOPPED)),
    );
    types.register(
        ServiceType::new("service", "Runs exec once, up when it exits 0")
            .on_start(|engine, id| {
                launch(engine, id, START_PROCESS)?;
                engine.mark_service_named(id, START_RUNNING)
            })
            .on_stop(stop_processes),
    );
    types.register(
        ServiceType::new("daemon", "Keeps exec running")
            .on_start(|engine, id| {
                launch(engine, id, DAEMON_PROCESS)?;
                engine.mark_service_named(id, RUNNING)
            })
            .on_stop(stop_processes),
    );
}

fn name(engine: &Engine, id: ServiceId) -> String {
    engine.service_name(id).unwrap_or("?").to_string()
}

fn in_state(engine: &Engine, id: ServiceId, state: &str) -> bool {
    engine.state_name(id) == Some(state)
}

/// Build the command line from exec, exec_args and env and spawn it
fn launch(engine: &mut Engine, id: ServiceId, process_type: &str) -> Result<ProcessId, EngineError> {
    let record = engine
        .services()
        .get(id)
        .ok_or_else(|| EngineError::NotFound(format!("service {:?}", id)))?;

    let Some(exec) = record.data.get_string(&EXEC, None) else {
        let err = EngineError::InvalidTransition {
            service: record.name.clone(),
            action: "start",
            reason: "it has no exec".to_string(),
        };
        mark_or_report(engine, id, START_FAILED);
        return Err(err);
    };

    let mut spec = ProcessSpec::parse(exec)?;
    for arg in record.data.strings(&EXEC_ARGS, None) {
        spec = spec.arg(arg);
    }
    for (key, value) in record.data.keyed(&ENV) {
        spec = spec.env(key, value.to_string());
    }
    spec = spec.pipe(PipeSpec::new(PipeDirection::Output, &[1, 2]));

    let ptype = engine
        .find_process_type(process_type)
        .ok_or_else(|| EngineError::NotFound(format!("Process type \"{}\"", process_type)))?;

    match engine.spawn_bound(id, ptype, spec) {
        Ok(process) => Ok(process),
        Err(e) => {
            mark_or_report(engine, id, START_FAILED);
            Err(e)
        }
    }
}

fn mark_or_report(engine: &mut Engine, id: ServiceId, state: &str) {
    if let Err(e) = engine.mark_service_named(id, state) {
        let msg = format!("Could not mark {} {}: {}", name(engine, id), state, e);
        engine.report(Severity::Fail, &msg);
    }
}

fn stop_processes(engine: &mut Engine, id: ServiceId) -> Result<(), EngineError> {
    let live = engine
        .services()
        .get(id)
        .map_or(0, |s| s.processes.len());
    if live == 0 {
        return engine.mark_service_named(id, STOPPED);
    }

    engine.mark_service_named(id, STOP_RUNNING)?;
    engine.kill_service_processes(id, Signal::SIGTERM);
    Ok(())
}

fn arm_start_timeout(engine: &mut Engine, id: ServiceId) {
    let timeout = engine
        .services()
        .get(id)
        .and_then(|s| s.data.get_int(&TIMEOUT, None))
        .filter(|secs| *secs > 0)
        .map(|secs| std::time::Duration::from_secs(secs as u64))
        .unwrap_or(engine.config().start_timeout);
    engine.set_alarm(id, timeout);
}

fn start_timed_out(engine: &mut Engine, id: ServiceId) {
    let msg = format!("{} did not finish starting in time", name(engine, id));
    engine.report(Severity::Warn, &msg);
    engine.kill_service_processes(id, Signal::SIGKILL);
    mark_or_report(engine, id, START_FAILED);
}

fn exit_status(engine: &Engine, process: ProcessId) -> Option<crate::engine::ExitStatus> {
    engine.processes().get(process).and_then(|p| p.exit)
}

fn start_process_exited(engine: &mut Engine, id: ServiceId, process: ProcessId) {
    let status = exit_status(engine, process);
    engine.free_process(process);

    if in_state(engine, id, STOP_RUNNING) {
        mark_or_report(engine, id, STOPPED);
        return;
    }

    match status {
        Some(s) if s.success() => mark_or_report(engine, id, DONE),
        _ => {
            let msg = format!("{} failed to start: {:?}", name(engine, id), status);
            engine.report(Severity::Warn, &msg);
            mark_or_report(engine, id, START_FAILED);
        }
    }
}

fn daemon_process_exited(engine: &mut Engine, id: ServiceId, process: ProcessId) {
    let status = exit_status(engine, process);
    engine.free_process(process);

    if in_state(engine, id, STOP_RUNNING) {
        mark_or_report(engine, id, STOPPED);
        return;
    }

    let respawn = engine
        .services()
        .get(id)
        .is_some_and(|s| s.data.is_set(&RESPAWN, None));
    if respawn && engine.system_state() != SystemState::Stopping {
        log::info!("{} died ({:?}), respawning", name(engine, id), status);
        mark_or_report(engine, id, STOPPED);
        if let Err(e) = engine.start_service(id) {
            let msg = format!("Respawn of {} failed: {}", name(engine, id), e);
            engine.report(Severity::Fail, &msg);
        }
        return;
    }

    match status {
        Some(s) if s.success() => mark_or_report(engine, id, STOPPED),
        _ => {
            let msg = format!("{} died: {:?}", name(engine, id), status);
            engine.report(Severity::Warn, &msg);
            mark_or_report(engine, id, START_FAILED);
        }
    }
}
