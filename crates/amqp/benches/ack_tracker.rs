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

use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use nautilus_amqp::{
    ack::AckTracker,
    broker::{BrokerChannel, memory::InMemoryBroker},
    config::{Credentials, Endpoint},
    rpc::RpcCorrelator,
};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn channel(runtime: &Runtime) -> Arc<dyn BrokerChannel> {
    let broker = InMemoryBroker::new();
    runtime.block_on(async {
        let connection = broker
            .connector()
            .connect(&Endpoint::default(), &Credentials::default(), "/", None)
            .await
            .expect("Failed to connect");
        connection
            .create_channel()
            .await
            .expect("Failed to create channel")
    })
}

fn bench_register_and_settle(c: &mut Criterion) {
    let runtime = runtime();
    let tracker = Arc::new(AckTracker::new(channel(&runtime), false));
    let mut delivery_tag = 0;

    c.bench_function("AckTracker::register+ack", |b| {
        b.iter(|| {
            delivery_tag += 1;
            let handle = tracker.register(black_box(delivery_tag));
            runtime
                .block_on(handle.ack())
                .expect("Acknowledgment failed");
        });
    });
}

fn bench_teardown(c: &mut Criterion) {
    let runtime = runtime();
    let channel = channel(&runtime);

    c.bench_function("AckTracker::teardown(1000)", |b| {
        b.iter(|| {
            let tracker = Arc::new(AckTracker::new(channel.clone(), true));
            let handles: Vec<_> = (1..=1000).map(|tag| tracker.register(tag)).collect();
            tracker.teardown("closed");
            black_box(handles);
        });
    });
}

fn bench_correlate_replies(c: &mut Criterion) {
    let correlator = RpcCorrelator::new();

    c.bench_function("RpcCorrelator::register+record_reply", |b| {
        b.iter(|| {
            let _completion = correlator.register("request", 2);
            black_box(correlator.record_reply("request"));
            black_box(correlator.record_reply("request"));
        });
    });
}

criterion_group!(
    benches,
    bench_register_and_settle,
    bench_teardown,
    bench_correlate_replies,
);
criterion_main!(benches);
