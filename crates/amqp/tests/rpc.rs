// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! End-to-end tests of RPC flows against a responder built from a source and a reply-to sink.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use nautilus_amqp::{
    AmqpRpcFlow, AmqpSink, AmqpSource, Done, OutgoingMessage,
    broker::memory::InMemoryBroker,
    config::{ConnectionConfig, ReplyToSinkConfig, RpcConfig, SinkConfig, SourceConfig},
    declaration::QueueDeclaration,
    message::MessageProperties,
    testing::wait_until_async,
};
use rstest::{fixture, rstest};
use tokio::task::JoinHandle;

const REQUESTS: &str = "rpc.requests";

#[fixture]
fn broker() -> InMemoryBroker {
    InMemoryBroker::new()
}

/// Answers each request with `replies` messages: the body suffixed by one, two, ... `a`s.
async fn responder(broker: &InMemoryBroker, replies: usize) -> JoinHandle<()> {
    let source = AmqpSource::new(
        broker.connector(),
        ConnectionConfig::local(),
        SourceConfig::named(REQUESTS).with_declaration(QueueDeclaration::new(REQUESTS)),
    );
    let sink = AmqpSink::reply_to(
        broker.connector(),
        ConnectionConfig::local(),
        ReplyToSinkConfig::default(),
    );

    let handle = tokio::spawn(async move {
        let answers = source
            .committable()
            .take_while(|request| futures::future::ready(request.is_ok()))
            .filter_map(|request| async move { request.ok() })
            .then(move |request| async move {
                let body = request.message.body_utf8();
                let answers: Vec<OutgoingMessage> = (1..=replies)
                    .map(|n| request.message.reply(format!("{body}{}", "a".repeat(n))))
                    .collect();
                request.ack().await.unwrap();
                stream::iter(answers)
            })
            .flatten();
        let _ = sink.run(answers).await;
    });

    wait_until_async(
        || {
            let broker = broker.clone();
            async move { broker.consumer_count(REQUESTS) == 1 }
        },
        Duration::from_secs(2),
    )
    .await;
    handle
}

fn flow(broker: &InMemoryBroker, replies_per_message: usize) -> AmqpRpcFlow {
    AmqpRpcFlow::new(
        broker.connector(),
        ConnectionConfig::local(),
        RpcConfig::new(
            SinkConfig::for_queue(REQUESTS).with_declaration(QueueDeclaration::new(REQUESTS)),
        )
        .with_replies_per_message(replies_per_message),
    )
}

fn requests(bodies: &[&'static str]) -> impl futures::Stream<Item = OutgoingMessage> + Send {
    stream::iter(bodies.iter().map(|body| OutgoingMessage::new(*body)).collect::<Vec<_>>())
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[tokio::test]
async fn test_every_request_receives_all_replies(
    broker: InMemoryBroker,
    #[case] replies_per_message: usize,
) {
    let responder = responder(&broker, replies_per_message).await;

    let (replies, completion) = flow(&broker, replies_per_message)
        .at_most_once(requests(&["one", "two", "three"]))
        .into_parts();
    let (replies, done) = tokio::join!(replies.try_collect::<Vec<_>>(), completion);

    assert_eq!(done.unwrap(), Done);
    let bodies: Vec<String> = replies.unwrap().iter().map(|r| r.body_utf8()).collect();
    assert_eq!(bodies.len(), 3 * replies_per_message);
    for request in ["one", "two", "three"] {
        let expected: Vec<String> = (1..=replies_per_message)
            .map(|n| format!("{request}{}", "a".repeat(n)))
            .collect();
        let received: Vec<String> = bodies
            .iter()
            .filter(|body| body.trim_end_matches('a') == request)
            .cloned()
            .collect();
        assert_eq!(received, expected);
    }
    responder.abort();
}

#[rstest]
#[tokio::test]
async fn test_empty_upstream_completes_without_replies(broker: InMemoryBroker) {
    let (replies, completion) = flow(&broker, 1).committable(stream::empty()).into_parts();

    assert_eq!(completion.await.unwrap(), Done);
    assert!(replies.try_collect::<Vec<_>>().await.unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_committable_completion_waits_for_settlement(broker: InMemoryBroker) {
    let responder = responder(&broker, 2).await;

    let run = flow(&broker, 2).committable(requests(&["one"]));
    wait_until_async(
        || {
            let connected = run.reply_queue().is_some();
            async move { connected }
        },
        Duration::from_secs(2),
    )
    .await;
    let reply_queue = run.reply_queue().unwrap().to_string();
    assert!(reply_queue.starts_with("amq.gen-"));

    let (mut replies, completion) = run.into_parts();
    let first = replies.next().await.unwrap().unwrap();
    let second = replies.next().await.unwrap().unwrap();
    assert_eq!(first.message.body_utf8(), "onea");
    assert_eq!(second.message.body_utf8(), "oneaa");

    let completion = tokio::spawn(completion);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!completion.is_finished());

    first.ack().await.unwrap();
    second.ack().await.unwrap();

    assert_eq!(completion.await.unwrap().unwrap(), Done);
    assert!(replies.next().await.is_none());
    assert!(!broker.queue_exists(&reply_queue));
    responder.abort();
}

#[rstest]
#[tokio::test]
async fn test_replies_without_pending_request_are_dropped(broker: InMemoryBroker) {
    let run = flow(&broker, 1).at_most_once(requests(&["lost"]));
    wait_until_async(
        || {
            let connected = run.reply_queue().is_some();
            async move { connected }
        },
        Duration::from_secs(2),
    )
    .await;
    let reply_queue = run.reply_queue().unwrap().to_string();

    // A stray reply with an unknown correlation id, then the real answer
    AmqpSink::new(
        broker.connector(),
        ConnectionConfig::local(),
        SinkConfig::for_queue(reply_queue.as_str()),
    )
    .run(stream::iter([OutgoingMessage::new("stray")
        .with_properties(MessageProperties::default().with_correlation_id("unknown"))]))
    .await
    .unwrap();
    let responder = responder(&broker, 1).await;

    let (replies, completion) = run.into_parts();
    let (replies, done) = tokio::join!(replies.try_collect::<Vec<_>>(), completion);

    assert_eq!(done.unwrap(), Done);
    let bodies: Vec<String> = replies.unwrap().iter().map(|r| r.body_utf8()).collect();
    assert_eq!(bodies, vec!["losta"]);
    responder.abort();
}
