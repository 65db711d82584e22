// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tokio::select;

use azure_iot_operations_mqtt::control_packet::{Publish, QoS};
use azure_iot_operations_mqtt::interface::{ManagedClient, PubReceiver};
use azure_iot_operations_mqtt::interface_mocks::{MockClient, MockEventLoop};
use azure_iot_operations_mqtt::session::{Session, reconnect_policy::ExponentialBackoffWithJitter};
use azure_iot_operations_mqtt::{Event, Incoming};

#[tokio::test]
async fn mock_event_loop() {
    const CLIENT_ID: &str = "MyClientId";

    let client = MockClient::new();
    let (event_loop, injector) = MockEventLoop::new();

    let mut session = Session::new_from_injection(
        client,
        event_loop,
        Box::new(ExponentialBackoffWithJitter::default()),
        CLIENT_ID.to_string(),
        None,
    );

    let exit_handle = session.create_exit_handle();
    let managed_client = session.create_managed_client();
    let mut pub_receiver = managed_client
        .create_filtered_pub_receiver("test/resp/topic")
        .unwrap();

    let drive = async {
        injector
            .inject(Event::Incoming(Incoming::Publish(Publish::new(
                "test/resp/topic",
                QoS::AtLeastOnce,
                Vec::new(),
                None,
            ))))
            .unwrap();

        let received_pub = pub_receiver.recv().await.unwrap();
        assert_eq!(received_pub.topic, "test/resp/topic");

        exit_handle.exit_force().await;
    };

    select! {
        () = drive => {}
        _ = session.run() => {}
    }
}
