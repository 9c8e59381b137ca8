//! Loopback tests driving the client and server together on one
//! event-loop thread.

use std::future::Future;

use bytes::Bytes;
use http::{Request, Response, StatusCode};

use strand_http::{
    make_handler, ChunkStream, Client, HttpError, LocalExecutor, RequestBody, Server,
    ServerConfig, StopSource, StopToken,
};

fn run<F: Future>(future: F) -> F::Output {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).init();
    });
    LocalExecutor::new().expect("build executor").block_on(future)
}

async fn start<H>(handler: H) -> (Server<H>, std::net::SocketAddr)
where
    H: strand_http::Handler + 'static,
{
    let server = Server::bind(ServerConfig::new("127.0.0.1", 0), handler).await.expect("bind");
    let addr = server.local_addr();
    let serving = server.clone();
    strand_http::spawn_detached(async move { serving.serve().await });
    (server, addr)
}

fn get(url: String) -> Request<RequestBody> {
    Request::builder().method("GET").uri(url).body(RequestBody::Empty).expect("build request")
}

#[test]
fn hello_streaming_round_trip() {
    run(async {
        let handler = make_handler(|_req, _stop| async move {
            let response = Response::builder()
                .status(200)
                .header("Content-Type", "text/plain")
                .body(ChunkStream::from_chunks(["hel", "lo"]))
                .unwrap();
            Ok::<_, HttpError>(response)
        });
        let (_server, addr) = start(handler).await;

        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/hello")), StopToken::never()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // received header names are lowercase, lookup is case-insensitive
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");

        let body = response.body_mut().collect().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    });
}

#[test]
fn path_echo_round_trip() {
    run(async {
        let handler = make_handler(|req: Request<ChunkStream>, _stop| async move {
            let path = req.uri().path().to_owned();
            Ok::<_, HttpError>(Response::builder().status(200).body(ChunkStream::from(path)).unwrap())
        });
        let (_server, addr) = start(handler).await;

        let client = Client::default();
        let mut response = client
            .fetch(get(format!("http://{addr}/some/nested/path")), StopToken::never())
            .await
            .unwrap();

        let body = response.body_mut().collect().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"/some/nested/path"));
    });
}

#[test]
fn status_is_data_not_error() {
    run(async {
        let handler = make_handler(|_req, _stop| async move {
            Ok::<_, HttpError>(
                Response::builder().status(404).body(ChunkStream::from("missing")).unwrap(),
            )
        });
        let (_server, addr) = start(handler).await;

        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/nope")), StopToken::never()).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body_mut().collect().await.unwrap(), Bytes::from_static(b"missing"));
    });
}

#[test]
fn quit_endpoint_shuts_the_server_down() {
    run(async {
        let handler = make_handler(|_req, _stop| async move {
            Ok::<_, HttpError>(Response::builder().status(200).body(ChunkStream::empty()).unwrap())
        });
        let (server, addr) = start(handler).await;

        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/quit")), StopToken::never()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body_mut().collect().await.unwrap().is_empty());

        // quit is idempotent; both calls observe the same drain
        server.quit().await.unwrap();
        server.quit().await.unwrap();

        // the listener is closed: further connects fail
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    });
}

#[test]
fn echo_with_empty_chunk_in_generator() {
    run(async {
        let handler = make_handler(|req: Request<ChunkStream>, _stop| async move {
            let mut body = req.into_body();
            let bytes = body.collect().await?;
            Ok::<_, HttpError>(Response::builder().status(200).body(ChunkStream::from(bytes)).unwrap())
        });
        let (_server, addr) = start(handler).await;

        // a live generator with an empty chunk in the middle goes out chunked
        let (mut tx, body_stream) = ChunkStream::channel();
        strand_http::spawn_detached(async move {
            for part in ["ab", "", "c"] {
                if tx.send(Bytes::from_static(part.as_bytes())).await.is_err() {
                    return Ok(());
                }
            }
            tx.close(Ok(()));
            Ok(())
        });

        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/echo"))
            .body(RequestBody::Stream(body_stream))
            .unwrap();

        let client = Client::default();
        let mut response = client.fetch(request, StopToken::never()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body_mut().collect().await.unwrap(), Bytes::from_static(b"abc"));
    });
}

#[test]
fn large_multi_chunk_upload_reassembles() {
    run(async {
        let handler = make_handler(|req: Request<ChunkStream>, _stop| async move {
            let mut body = req.into_body();
            let bytes = body.collect().await?;
            Ok::<_, HttpError>(Response::builder().status(200).body(ChunkStream::from(bytes)).unwrap())
        });
        let (_server, addr) = start(handler).await;

        let sizes = [1usize, 17, 1000, 8192, 3, 40000, 5];
        let mut expected = Vec::new();
        let mut chunks = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let chunk = vec![b'a' + (i as u8); *size];
            expected.extend_from_slice(&chunk);
            chunks.push(Bytes::from(chunk));
        }

        let (mut tx, body_stream) = ChunkStream::channel();
        strand_http::spawn_detached(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
            tx.close(Ok(()));
            Ok(())
        });

        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/echo"))
            .body(RequestBody::Stream(body_stream))
            .unwrap();

        let client = Client::default();
        let mut response = client.fetch(request, StopToken::never()).await.unwrap();
        let body = response.body_mut().collect().await.unwrap();
        assert_eq!(body.len(), expected.len());
        assert_eq!(body, Bytes::from(expected));
    });
}

#[test]
fn full_body_posts_with_content_length() {
    run(async {
        let handler = make_handler(|req: Request<ChunkStream>, _stop| async move {
            let declared = req
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .unwrap_or_default();
            let mut body = req.into_body();
            let bytes = body.collect().await?;
            let reply = format!("{declared}:{}", String::from_utf8_lossy(&bytes));
            Ok::<_, HttpError>(Response::builder().status(200).body(ChunkStream::from(reply)).unwrap())
        });
        let (_server, addr) = start(handler).await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/echo"))
            .body(RequestBody::from("payload"))
            .unwrap();

        let client = Client::default();
        let mut response = client.fetch(request, StopToken::never()).await.unwrap();
        assert_eq!(
            response.body_mut().collect().await.unwrap(),
            Bytes::from_static(b"7:payload")
        );
    });
}

#[test]
fn stop_after_headers_interrupts_body() {
    run(async {
        let handler = make_handler(|_req, stop: StopToken| async move {
            let (mut tx, body) = ChunkStream::channel();
            strand_http::spawn_detached(async move {
                if tx.send(Bytes::from_static(b"first")).await.is_err() {
                    return Ok(());
                }
                // hold the stream open until the request is cancelled
                stop.stopped().await;
                tx.fail(HttpError::Interrupted);
                Ok(())
            });
            Ok::<_, HttpError>(Response::builder().status(200).body(body).unwrap())
        });
        let (_server, addr) = start(handler).await;

        let stop = StopSource::new();
        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/slow")), stop.token()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let first = response.body_mut().next().await.unwrap();
        assert!(first.is_some_and(|chunk| !chunk.is_empty()));

        stop.request_stop();

        // chunks already in flight may still surface, then the
        // interruption must be raised and nothing further delivered
        let mut drained = 0usize;
        loop {
            match response.body_mut().next().await {
                Err(HttpError::Interrupted) => break,
                Err(other) => panic!("expected interruption, got {other}"),
                Ok(Some(chunk)) => {
                    drained += chunk.len();
                    assert!(drained < 16, "body kept flowing after stop");
                }
                Ok(None) => panic!("stream ended cleanly despite stop"),
            }
        }
    });
}

#[test]
fn stop_before_connect_interrupts_fetch() {
    run(async {
        let stop = StopSource::new();
        stop.request_stop();

        let client = Client::default();
        // nothing listens on this port; the stop wins before any transport error
        let result = client.fetch(get("http://127.0.0.1:9/hang".to_string()), stop.token()).await;
        assert!(matches!(result, Err(HttpError::Interrupted)));
    });
}

#[test]
fn unparseable_status_is_a_transport_error() {
    run(async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // a raw peer that answers with a garbage status line
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        strand_http::spawn_detached(async move {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| HttpError::transport("accept failed", e))?;
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"HTTP/1.1 abc OK\r\n\r\n").await.ok();
            Ok(())
        });

        let client = Client::default();
        let result = client.fetch(get(format!("http://{addr}/x")), StopToken::never()).await;
        assert!(matches!(result, Err(HttpError::Transport { .. })));
    });
}

#[test]
fn handler_failure_yields_500_with_empty_body() {
    run(async {
        let handler = make_handler(|_req, _stop| async move {
            Err::<Response<ChunkStream>, HttpError>(HttpError::transport_msg("handler blew up"))
        });
        let (_server, addr) = start(handler).await;

        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/boom")), StopToken::never()).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.body_mut().collect().await.unwrap().is_empty());
    });
}

#[test]
fn graceful_shutdown_aborts_streaming_reply() {
    run(async {
        let handler = make_handler(|_req, _stop| async move {
            let (mut tx, body) = ChunkStream::channel();
            strand_http::spawn_detached(async move {
                // stream until the reply is torn down
                while tx.send(Bytes::from_static(b"data-")).await.is_ok() {}
                Ok(())
            });
            Ok::<_, HttpError>(Response::builder().status(200).body(body).unwrap())
        });
        let (server, addr) = start(handler).await;

        let client = Client::default();
        let mut response =
            client.fetch(get(format!("http://{addr}/stream")), StopToken::never()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body_mut().next().await.unwrap().is_some());

        // quit must drain even though a reply is mid-stream: the chained
        // per-request stop aborts the streaming body
        server.quit().await.unwrap();

        // the connection was cut mid-body; the client surfaces an error,
        // not a clean end
        loop {
            match response.body_mut().next().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated body ended cleanly"),
                Err(_) => break,
            }
        }

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    });
}

#[test]
fn header_case_and_repetition_survive_the_wire() {
    run(async {
        let handler = make_handler(|req: Request<ChunkStream>, _stop| async move {
            // case-insensitive lookup of a mixed-case request header
            let tag = req.headers().get("x-request-tag").unwrap().to_str().unwrap().to_owned();
            let response = Response::builder()
                .status(200)
                .header("X-Reply-Tag", tag)
                .header("X-Reply-Tag", "second")
                .body(ChunkStream::empty())
                .unwrap();
            Ok::<_, HttpError>(response)
        });
        let (_server, addr) = start(handler).await;

        let request = Request::builder()
            .method("GET")
            .uri(format!("http://{addr}/tags"))
            .header("X-Request-Tag", "mixed-case")
            .body(RequestBody::Empty)
            .unwrap();

        let client = Client::default();
        let response = client.fetch(request, StopToken::never()).await.unwrap();

        let replies: Vec<_> = response.headers().get_all("x-reply-tag").iter().collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], "mixed-case");
        assert_eq!(replies[1], "second");
    });
}
