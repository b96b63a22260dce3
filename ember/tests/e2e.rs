//! Wire-level end-to-end tests: a real app on a background thread, raw
//! TCP clients in the foreground.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ember::{route, App, AsyncResponse, Middleware, Prior, Request, Response, StopHandle};

fn spawn_server(port: u16, configure: fn(&mut App)) -> (thread::JoinHandle<()>, StopHandle) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut app = App::new();
        configure(&mut app);
        app.port(port).bindaddr("127.0.0.1");
        tx.send(app.stop_handle()).unwrap();
        app.run().unwrap();
    });
    let stop = rx.recv().unwrap();
    (handle, stop)
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_secs(15)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("server did not come up on port {port}");
}

struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed mid-response");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
        })
        .collect();
    let length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    RawResponse {
        status,
        headers,
        body,
    }
}

fn send(stream: &mut TcpStream, request: &str) -> RawResponse {
    stream.write_all(request.as_bytes()).unwrap();
    read_response(stream)
}

fn basic_routes(app: &mut App) {
    route!(app, "/a/<int>/b").handle(|_req: &Request, res: Rc<AsyncResponse>, n: i64| {
        res.response().write(format!("n={n}"));
        res.end();
    });
}

#[test]
fn simple_get_decodes_typed_parameters() {
    let (_server, stop) = spawn_server(62801, basic_routes);
    let mut stream = connect(62801);

    let res = send(&mut stream, "GET /a/42/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "n=42");
    assert!(res.header("date").is_some());
    assert_eq!(res.header("server"), Some("ember"));

    stop.stop();
}

#[test]
fn method_mismatch_is_405_with_allow() {
    let (_server, stop) = spawn_server(62802, basic_routes);
    let mut stream = connect(62802);

    let res = send(&mut stream, "POST /a/42/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 405);
    assert_eq!(res.header("allow"), Some("GET"));

    stop.stop();
}

#[test]
fn unknown_path_is_404_and_honors_keep_alive() {
    let (_server, stop) = spawn_server(62803, basic_routes);
    let mut stream = connect(62803);

    let res = send(&mut stream, "GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 404);

    // the same socket still serves the next request
    let res = send(&mut stream, "GET /a/7/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "n=7");

    stop.stop();
}

#[test]
fn keep_alive_requests_are_independent() {
    let (_server, stop) = spawn_server(62804, basic_routes);
    let mut stream = connect(62804);

    let res = send(&mut stream, "GET /a/1/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.body_str(), "n=1");
    let res = send(&mut stream, "GET /a/2/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.body_str(), "n=2");
    // still open: a third request goes through
    let res = send(&mut stream, "GET /a/3/b HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.body_str(), "n=3");

    stop.stop();
}

#[test]
fn missing_host_on_http11_is_400_and_closes() {
    let (_server, stop) = spawn_server(62805, basic_routes);
    let mut stream = connect(62805);

    let res = send(&mut stream, "GET /a/1/b HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 400);
    assert_eq!(res.header("connection"), Some("close"));

    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0, "server should close after a 400");

    stop.stop();
}

#[test]
fn oversize_body_is_rejected_with_413() {
    let (_server, stop) = spawn_server(62806, basic_routes);
    let mut stream = connect(62806);

    let too_big = 30 * 1024 * 1024 + 1;
    let res = send(
        &mut stream,
        &format!("POST /a/1/b HTTP/1.1\r\nHost: x\r\nContent-Length: {too_big}\r\n\r\n"),
    );
    assert_eq!(res.status, 413);

    stop.stop();
}

fn panicking_route(app: &mut App) {
    route!(app, "/boom").handle(|_req: &Request, _res: Rc<AsyncResponse>| {
        panic!("handler blew up");
    });
}

#[test]
fn handler_panic_becomes_500_and_closes() {
    let (_server, stop) = spawn_server(62807, panicking_route);
    let mut stream = connect(62807);

    let res = send(&mut stream, "GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 500);
    assert_eq!(res.header("connection"), Some("close"));

    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);

    stop.stop();
}

fn deferred_route(app: &mut App) {
    route!(app, "/defer").handle(|_req: &Request, res: Rc<AsyncResponse>| {
        let deferred = res.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if deferred.is_alive() {
                deferred.response().write("deferred");
            }
            deferred.end();
        });
    });
}

#[test]
fn deferred_completion_writes_later() {
    let (_server, stop) = spawn_server(62808, deferred_route);
    let mut stream = connect(62808);

    let res = send(&mut stream, "GET /defer HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "deferred");

    stop.stop();
}

fn echo_length_route(app: &mut App) {
    route!(app, "/echo").methods([ember::Method::POST]).handle(
        |req: &Request, res: Rc<AsyncResponse>| {
            res.response().write(format!("len={}", req.body.len()));
            res.end();
        },
    );
}

#[test]
fn chunked_request_bodies_are_decoded() {
    let (_server, stop) = spawn_server(62809, echo_length_route);
    let mut stream = connect(62809);

    let res = send(
        &mut stream,
        "POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
         4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "len=9");

    stop.stop();
}

#[test]
fn body_at_exactly_the_cap_is_accepted() {
    let (_server, stop) = spawn_server(62813, echo_length_route);
    let mut stream = connect(62813);

    let cap = 30 * 1024 * 1024;
    stream
        .write_all(format!("POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {cap}\r\n\r\n").as_bytes())
        .unwrap();
    stream.write_all(&vec![0u8; cap]).unwrap();
    let res = read_response(&mut stream);
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), format!("len={cap}"));

    stop.stop();
}

struct Gate;

impl Middleware for Gate {
    type Context = ();

    fn before_handle(
        &self,
        req: &mut Request,
        res: &mut Response,
        _ctx: &mut Self::Context,
        _prior: &Prior<'_>,
    ) {
        if req.header("x-forbid").is_some() {
            res.set_status(ember::StatusCode::FORBIDDEN);
            res.end();
        }
    }

    fn after_handle(
        &self,
        _req: &mut Request,
        res: &mut Response,
        _ctx: &mut Self::Context,
        _prior: &Prior<'_>,
    ) {
        res.add_header(
            ember::HeaderName::from_static("x-gate"),
            ember::HeaderValue::from_static("passed"),
        );
    }
}

#[test]
fn middleware_short_circuits_and_post_processes() {
    let (tx, rx) = mpsc::channel();
    let _server = thread::spawn(move || {
        let mut app = App::with_middlewares((Gate,));
        route!(app, "/guarded").handle(|_req: &Request, res: Rc<AsyncResponse>| {
            res.response().write("inside");
            res.end();
        });
        app.port(62810).bindaddr("127.0.0.1");
        tx.send(app.stop_handle()).unwrap();
        app.run().unwrap();
    });
    let stop: StopHandle = rx.recv().unwrap();
    let mut stream = connect(62810);

    let res = send(&mut stream, "GET /guarded HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "inside");
    assert_eq!(res.header("x-gate"), Some("passed"));

    let res = send(
        &mut stream,
        "GET /guarded HTTP/1.1\r\nHost: x\r\nx-forbid: 1\r\n\r\n",
    );
    assert_eq!(res.status, 403);
    // the after hook of the executed prefix still ran
    assert_eq!(res.header("x-gate"), Some("passed"));

    stop.stop();
}

#[test]
fn idle_connection_is_closed_by_the_deadline() {
    let (_server, stop) = spawn_server(62811, basic_routes);
    let mut stream = connect(62811);

    // Send nothing: the 5s deadline plus the 1Hz sweep closes the socket.
    let start = std::time::Instant::now();
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "server should close an idle connection");
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(4), "closed too early: {waited:?}");
    assert!(waited < Duration::from_secs(10), "closed too late: {waited:?}");

    // and a write on the closed socket eventually fails
    let dead = stream.write_all(b"GET / HTTP/1.1\r\n").is_err()
        || stream.write_all(b"Host: x\r\n\r\n").is_err()
        || stream.read(&mut buf).map(|n| n == 0).unwrap_or(true);
    assert!(dead);

    stop.stop();
}

mod websocket {
    use super::*;
    use ember::WebSocketRouteExt;

    fn ws_routes(app: &mut App) {
        route!(app, "/ws").websocket(|ws| {
            ws.onmessage(|session, payload, is_text| {
                assert!(is_text);
                let mut echoed = b"echo:".to_vec();
                echoed.extend_from_slice(payload);
                session.send_text(String::from_utf8(echoed).unwrap());
            })
        });
    }

    fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let key = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut out = vec![0x80 | opcode, 0x80 | payload.len() as u8];
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    fn read_headers(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert!(stream.read(&mut byte).unwrap() > 0);
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[test]
    fn upgrade_and_text_echo() {
        let (_server, stop) = spawn_server(62812, ws_routes);
        let mut stream = connect(62812);

        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Host: x\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Protocol: console.v1\r\n\r\n",
            )
            .unwrap();

        let headers = read_headers(&mut stream);
        assert!(headers.starts_with("HTTP/1.1 101"), "got: {headers}");
        assert!(headers.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(headers.to_ascii_lowercase().contains("sec-websocket-protocol: console.v1"));

        stream.write_all(&masked_frame(0x1, b"hi")).unwrap();

        let mut frame_head = [0u8; 2];
        stream.read_exact(&mut frame_head).unwrap();
        assert_eq!(frame_head[0], 0x81);
        let len = (frame_head[1] & 0x7f) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        assert_eq!(payload, b"echo:hi");

        stop.stop();
    }
}
