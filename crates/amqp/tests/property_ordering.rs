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

//! Property-based tests for delivery ordering and reply correlation.
//!
//! - Committable sources emit messages in publish order for any buffer size
//! - The correlator completes a request exactly when its last expected reply arrives

use futures::{StreamExt, stream};
use nautilus_amqp::{
    AmqpSink, AmqpSource, OutgoingMessage,
    broker::memory::InMemoryBroker,
    config::{ConnectionConfig, SinkConfig, SourceConfig},
    declaration::QueueDeclaration,
    rpc::{ReplyMatch, RpcCorrelator},
};
use proptest::prelude::*;
use rstest::rstest;

const QUEUE: &str = "ordered";

fn consume_in_order(message_count: usize, buffer_size: usize) -> Vec<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let broker = InMemoryBroker::new();
        let declaration = QueueDeclaration::new(QUEUE);
        AmqpSink::new(
            broker.connector(),
            ConnectionConfig::local(),
            SinkConfig::for_queue(QUEUE).with_declaration(declaration.clone()),
        )
        .run(stream::iter(
            (0..message_count).map(|i| OutgoingMessage::new(i.to_string())),
        ))
        .await
        .unwrap();

        let mut source = AmqpSource::new(
            broker.connector(),
            ConnectionConfig::local(),
            SourceConfig::named(QUEUE)
                .with_declaration(declaration)
                .with_buffer_size(buffer_size),
        )
        .committable();

        let mut received = Vec::with_capacity(message_count);
        while received.len() < message_count {
            let message = source.next().await.unwrap().unwrap();
            received.push(message.message.body_utf8());
            message.ack().await.unwrap();
        }
        source.cancel().await;
        received
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: Messages are emitted in the order they were published.
    #[rstest]
    fn source_preserves_publish_order(
        message_count in 1usize..=40,
        buffer_size in 1usize..=8,
    ) {
        let received = consume_in_order(message_count, buffer_size);

        let expected: Vec<String> = (0..message_count).map(|i| i.to_string()).collect();
        prop_assert_eq!(received, expected);
    }

    /// Property: A request completes on exactly its last expected reply.
    #[rstest]
    fn correlator_completes_on_last_reply(
        expected in proptest::collection::vec(1usize..=4, 1..=6),
        order_seed in any::<u64>(),
    ) {
        let correlator = RpcCorrelator::new();
        let completions: Vec<_> = expected
            .iter()
            .enumerate()
            .map(|(i, count)| correlator.register(i.to_string(), *count))
            .collect();

        // Interleave replies deterministically from the seed
        let mut replies: Vec<usize> = expected
            .iter()
            .enumerate()
            .flat_map(|(i, count)| std::iter::repeat_n(i, *count))
            .collect();
        let len = replies.len();
        for i in 0..len {
            let j = (order_seed as usize).wrapping_add(i * 7) % len;
            replies.swap(i, j);
        }

        let mut received = vec![0usize; expected.len()];
        for request in replies {
            received[request] += 1;
            let remaining = expected[request] - received[request];

            prop_assert_eq!(
                correlator.record_reply(&request.to_string()),
                ReplyMatch::Matched { remaining }
            );
            prop_assert_eq!(completions[request].is_complete(), remaining == 0);
        }

        prop_assert!(correlator.is_empty());
        prop_assert_eq!(correlator.pending_replies(), 0);
        prop_assert_eq!(correlator.record_reply("0"), ReplyMatch::Unknown);
    }
}
