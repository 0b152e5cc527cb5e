use super::{Debugger, Request, Response};
use crate::{emulator::Emulator, errors::Result};
use log::{debug, info, warn};
use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    sync::mpsc,
    thread,
};

fn write_response(writer: &mut impl Write, response: &Response) -> Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Answer requests read from `reader` until it closes or a `kill` arrives.
///
/// Lines are read on a separate thread so an `interrupt` can pause a
/// `continue` that is still running; every other request waits for the
/// previous one to finish.
pub fn serve<R, W>(emu: Emulator, reader: R, mut writer: W) -> Result<Emulator>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let control = emu.control();
    let mut debugger = Debugger::new(emu)?;
    let (tx, rx) = mpsc::channel::<std::result::Result<Request, String>>();
    let reader_thread = thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("debug connection read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let request = serde_json::from_str::<Request>(&line).map_err(|e| e.to_string());
            if let Ok(Request::Interrupt) = request {
                control.pause();
            }
            if tx.send(request).is_err() {
                break;
            }
        }
    });

    for request in rx {
        let response = match request {
            Ok(request) => debugger.handle(request),
            Err(message) => Response::Error { message },
        };
        write_response(&mut writer, &response)?;
        if debugger.is_killed() {
            info!("debug session killed");
            break;
        }
    }
    // the reader may still block on an open connection, it ends with it
    if reader_thread.is_finished() {
        let _ = reader_thread.join();
    }
    debug!("debug session over");
    Ok(debugger.into_inner())
}

/// Serve one debugger connection accepted on `addr`.
pub fn serve_tcp(emu: Emulator, addr: &str) -> Result<Emulator> {
    let listener = TcpListener::bind(addr)?;
    info!("debugger listening on {}", listener.local_addr()?);
    let (stream, peer) = listener.accept()?;
    info!("debugger attached from {}", peer);
    let reader = BufReader::new(stream.try_clone()?);
    serve(emu, reader, stream)
}
