#![warn(rust_2018_idioms)]

//! Lights up every connected monitor of the primary GPU with a slowly changing color.
//!
//! Run from a tty. `SCANOUT_DEMO_FRAMES` limits the number of frames per output (default 600),
//! the variables of [`DrmBackendConfig::from_env`] tweak the backend.

use std::{cell::Cell, error::Error, path::PathBuf, rc::Rc, time::Duration};

use calloop::{EventLoop, LoopSignal};
use rustix::fs::OFlags;
use scanout::{
    backend::{
        drm::{
            BackendEvent, CalloopWatchdog, DamageRect, DrmBackend, DrmBackendConfig, DrmDevice, DrmDeviceFd,
            DrmNotifier, DumbRenderPath, OutputId, PresentationFlags,
        },
        session::{libseat::LibSeatSession, Event as SessionEvent, Session},
        udev::{gpu_by_name, primary_gpu, UdevBackend, UdevEvent},
    },
    utils::DeviceFd,
};
use tracing::{debug, error, info, warn};

type Backend = DrmBackend<DrmDevice, DumbRenderPath>;

const PAGEFLIP_TIMEOUT: Duration = Duration::from_secs(2);

struct DemoState {
    backend: Backend,
    session: LibSeatSession,
    signal: LoopSignal,
    frames: u64,
    max_frames: u64,
}

fn main() {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let config = DrmBackendConfig::from_env()?.with_pageflip_timeout(Some(PAGEFLIP_TIMEOUT));
    let max_frames = std::env::var("SCANOUT_DEMO_FRAMES")
        .ok()
        .and_then(|frames| frames.parse().ok())
        .unwrap_or(600);

    let (mut session, notifier) = LibSeatSession::new()?;
    let seat = session.seat();

    let path: PathBuf = match &config.specific_device {
        Some(name) => gpu_by_name(&seat, name)?.ok_or_else(|| format!("No device named {}", name))?,
        None => primary_gpu(&seat)?.ok_or("No GPU found")?,
    };
    info!(?path, "Using device");

    let fd = session.open(
        &path,
        OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
    )?;
    let fd = DrmDeviceFd::new(DeviceFd::from(fd));
    let device = DrmDevice::new(fd.clone(), config.force_legacy)?;
    let renderer = DumbRenderPath::new(fd.clone());
    let mut backend = DrmBackend::new(device, renderer, config)?;

    let mut event_loop: EventLoop<'static, DemoState> = EventLoop::try_new()?;
    let handle = event_loop.handle();
    let signal = event_loop.get_signal();

    let watchdog = CalloopWatchdog::new(handle.clone(), signal.clone());
    let exit_code: Rc<Cell<Option<i32>>> = watchdog.exit_code_handle();
    backend.set_watchdog(watchdog);

    handle.insert_source(DrmNotifier::new(fd), |(), _, state| {
        if let Err(err) = state.backend.dispatch_kms_events() {
            warn!("Failed to read kms events: {}", err);
        }
        handle_backend_events(state);
    })
    .map_err(|err| err.error)?;

    handle.insert_source(UdevBackend::new(&seat)?, |event, _, state| match event {
        UdevEvent::Changed { event, .. } => {
            if let Err(err) = state.backend.handle_uevent(&event) {
                warn!("Failed to handle uevent: {}", err);
            }
            handle_backend_events(state);
        }
        UdevEvent::Added { path, .. } => debug!(?path, "Ignoring new device"),
        UdevEvent::Removed { device_id } => debug!(device_id, "Ignoring removed device"),
    })
    .map_err(|err| err.error)?;

    handle.insert_source(notifier, |event, _, state| {
        match event {
            SessionEvent::PauseSession => {
                info!("Session paused");
                state.backend.session_paused();
            }
            SessionEvent::ActivateSession => {
                info!("Session activated");
                state.backend.session_activated();
            }
        }
        handle_backend_events(state);
    })
    .map_err(|err| err.error)?;

    let mut state = DemoState {
        backend,
        session,
        signal,
        frames: 0,
        max_frames,
    };
    enable_connected_heads(&mut state);
    handle_backend_events(&mut state);

    event_loop.run(None::<Duration>, &mut state, |state| {
        if state.frames >= state.max_frames {
            info!(frames = state.frames, "Done");
            state.signal.stop();
        }
    })?;

    if !state.session.is_active() {
        debug!("Exiting while the session is inactive");
    }
    Ok(exit_code.get().unwrap_or(0))
}

fn enable_connected_heads(state: &mut DemoState) {
    let free: Vec<_> = state
        .backend
        .heads()
        .iter()
        .filter(|head| head.is_connected() && !head.is_non_desktop() && head.output().is_none())
        .map(|head| head.connector())
        .collect();

    for connector in free {
        let id = match state.backend.create_output_for_head(connector) {
            Ok(id) => id,
            Err(err) => {
                warn!(?connector, "Failed to create output: {}", err);
                continue;
            }
        };
        if let Err(err) = state.backend.enable_output(id) {
            warn!(?connector, "Failed to enable output: {}", err);
            let _ = state.backend.destroy_output(id);
        }
    }
}

fn handle_backend_events(state: &mut DemoState) {
    loop {
        let events = state.backend.take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            match event {
                BackendEvent::RepaintNeeded { output } => {
                    if let Err(err) = state.backend.start_repaint_loop(output) {
                        warn!(?output, "Failed to start repaint loop: {}", err);
                    }
                }
                BackendEvent::FrameFinished { output, flags, .. } => {
                    if !flags.contains(PresentationFlags::INVALID) {
                        state.frames += 1;
                    }
                    if state.frames < state.max_frames {
                        repaint(state, output);
                    }
                }
                BackendEvent::HeadsChanged => enable_connected_heads(state),
                BackendEvent::ContentProtectionChanged { connector, protection } => {
                    info!(?connector, ?protection, "Content protection changed")
                }
            }
        }
    }
}

fn repaint(state: &mut DemoState, output: OutputId) {
    let Some(size) = state.backend.output(output).and_then(|o| o.mode()).map(|mode| mode.size()) else {
        return;
    };
    let shade = (state.frames % 256) as u32;
    state
        .backend
        .renderer_mut()
        .set_color(Some(output), (shade << 16) | (0x40 << 8) | (255 - shade));

    let damage = [DamageRect::new(0, 0, size.0 as i32, size.1 as i32)];
    let result = state
        .backend
        .repaint_begin()
        .and_then(|_| state.backend.repaint_output(output, &damage))
        .and_then(|_| state.backend.repaint_flush());
    if let Err(err) = result {
        warn!(?output, "Repaint failed: {}", err);
        state.backend.repaint_cancel();
    }
}
