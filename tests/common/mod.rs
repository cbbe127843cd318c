#![allow(dead_code)]

use anyhow::Result;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use troopwatch::Frame;

/// What the fake camera answers to every GET.
#[derive(Clone, Copy, Debug)]
pub enum CameraReply {
    NotFound,
    /// `multipart/x-mixed-replace; boundary=frame` with proper part headers.
    Multipart,
    /// Same bytes as `Multipart`, but advertised as a plain octet stream.
    RawMjpeg,
}

/// Loopback HTTP server standing in for a network camera.
pub struct CameraFixture {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CameraFixture {
    pub fn spawn(reply: CameraReply) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let requests = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let jpeg = test_jpeg(64, 48)?;

        let thread_requests = requests.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        thread_requests.fetch_add(1, Ordering::SeqCst);
                        let jpeg = jpeg.clone();
                        let shutdown = thread_shutdown.clone();
                        std::thread::spawn(move || {
                            let _ = serve(stream, reply, &jpeg, &shutdown);
                        });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown,
            join: Some(join),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/video", self.addr)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for CameraFixture {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve(mut stream: TcpStream, reply: CameraReply, jpeg: &[u8], shutdown: &AtomicBool) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..n]);
    }

    let content_type = match reply {
        CameraReply::NotFound => {
            stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
            return Ok(());
        }
        CameraReply::Multipart => "multipart/x-mixed-replace; boundary=frame",
        CameraReply::RawMjpeg => "application/octet-stream",
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        content_type
    );
    stream.write_all(header.as_bytes())?;
    while !shutdown.load(Ordering::SeqCst) {
        let part = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        stream.write_all(part.as_bytes())?;
        stream.write_all(jpeg)?;
        stream.write_all(b"\r\n")?;
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

pub fn test_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.extend_from_slice(&[(x * 4) as u8, (y * 4) as u8, 128]);
        }
    }
    Frame::from_bgr(pixels, width, height)?.encode_jpeg(90)
}

/// Send a raw request and return `(headers, body)` once the server closes.
pub fn http_request(addr: SocketAddr, request: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((headers, response[split..].to_vec()))
}
