use activity_stream::elasticsearch::{BulkItem, EsClient, EsEndpoint};
use mockito::Matcher;
use serde_json::json;

fn endpoint_for(server: &mockito::Server) -> EsEndpoint {
    let host_with_port = server.host_with_port();
    let (host, port) = host_with_port
        .split_once(':')
        .expect("mockito address always has a port");
    EsEndpoint {
        protocol: "http".to_string(),
        host: host.to_string(),
        port: port.to_string(),
        region: "us-east-2".to_string(),
        access_key_id: "some-id".to_string(),
        secret_key: "some-secret".to_string(),
    }
}

fn client_for(server: &mockito::Server) -> EsClient {
    EsClient::new(reqwest::Client::new(), endpoint_for(server))
}

#[tokio::test]
async fn bulk_uploads_are_signed_ndjson_with_a_trailing_newline() {
    let mut server = mockito::Server::new_async().await;

    let expected_body = concat!(
        r#"{"index":{"_id":"dit:exportOpportunities:Enquiry:49863:Create","_index":"activities__feed_id__first_feed__date__20180412t000000__abcd1234","_type":"_doc"}}"#,
        "\n",
        r#"{"id":"dit:exportOpportunities:Enquiry:49863:Create","published":"2018-04-12T12:48:13+00:00"}"#,
        "\n",
    );
    let mock = server
        .mock("POST", "/_bulk")
        .match_header("content-type", "application/x-ndjson")
        .match_header(
            "authorization",
            Matcher::Regex(
                "^AWS4-HMAC-SHA256 Credential=some-id/[0-9]{8}/us-east-2/es/aws4_request, \
                 SignedHeaders=content-type;host;x-amz-date, Signature=[0-9a-f]{64}$"
                    .to_string(),
            ),
        )
        .match_header("x-amz-date", Matcher::Regex("^[0-9]{8}T[0-9]{6}Z$".to_string()))
        .match_body(Matcher::Exact(expected_body.to_string()))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let items = vec![BulkItem::index_into(
        "activities__feed_id__first_feed__date__20180412t000000__abcd1234",
        "dit:exportOpportunities:Enquiry:49863:Create",
        json!({
            "id": "dit:exportOpportunities:Enquiry:49863:Create",
            "published": "2018-04-12T12:48:13+00:00",
        }),
    )];
    client_for(&server).bulk(&items).await.expect("bulk should succeed");

    mock.assert_async().await;
}

#[tokio::test]
async fn an_empty_page_does_not_touch_the_bulk_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .with_status(200)
        .with_body("{}")
        .expect(0)
        .create_async()
        .await;

    client_for(&server).bulk(&[]).await.expect("no-op bulk should succeed");

    mock.assert_async().await;
}

#[tokio::test]
async fn the_alias_swap_is_a_single_request_with_add_and_remove() {
    let mut server = mockito::Server::new_async().await;

    let listing = server
        .mock("GET", "/_aliases")
        .with_status(200)
        .with_body(
            json!({
                "activities__feed_id__first_feed__date__20180101t000000__abcd1234": {
                    "aliases": {"activities": {}}
                },
                "activities__feed_id__other__date__20180101t000000__efgh5678": {
                    "aliases": {"activities": {}}
                },
                "activities__feed_id__first_feed__date__20180102t000000__ijkl9012": {
                    "aliases": {}
                },
            })
            .to_string(),
        )
        .create_async()
        .await;

    let swap = server
        .mock("POST", "/_aliases")
        .match_body(Matcher::Json(json!({
            "actions": [
                {"remove": {
                    "index": "activities__feed_id__first_feed__date__20180101t000000__abcd1234",
                    "alias": "activities",
                }},
                {"add": {
                    "index": "activities__feed_id__first_feed__date__20180103t000000__mnop3456",
                    "alias": "activities",
                }},
            ],
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    client_for(&server)
        .add_remove_aliases_atomically(
            "activities__feed_id__first_feed__date__20180103t000000__mnop3456",
            "first_feed",
        )
        .await
        .expect("alias swap should succeed");

    listing.assert_async().await;
    swap.assert_async().await;
}

#[tokio::test]
async fn listing_partitions_indices_by_alias() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/_aliases")
        .with_status(200)
        .with_body(
            json!({
                "activities__feed_id__first_feed__date__a__b": {"aliases": {"activities": {}}},
                "activities__feed_id__first_feed__date__c__d": {"aliases": {}},
                "unrelated_index": {"aliases": {}},
            })
            .to_string(),
        )
        .create_async()
        .await;

    let (without_alias, with_alias) = client_for(&server)
        .get_old_index_names()
        .await
        .expect("listing should succeed");
    assert_eq!(
        without_alias,
        vec!["activities__feed_id__first_feed__date__c__d".to_string()]
    );
    assert_eq!(
        with_alias,
        vec!["activities__feed_id__first_feed__date__a__b".to_string()]
    );
}

#[tokio::test]
async fn creating_an_index_that_already_exists_is_fine() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("PUT", "/activities__feed_id__first_feed__date__a__b")
        .with_status(400)
        .with_body(r#"{"error":{"type":"resource_already_exists_exception"}}"#)
        .create_async()
        .await;

    client_for(&server)
        .create_index("activities__feed_id__first_feed__date__a__b")
        .await
        .expect("already-exists should not be an error");
}

#[tokio::test]
async fn other_index_creation_failures_raise() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("PUT", "/activities__feed_id__first_feed__date__a__b")
        .with_status(401)
        .with_body(r#"{"error": "some message"}"#)
        .create_async()
        .await;

    let error = client_for(&server)
        .create_index("activities__feed_id__first_feed__date__a__b")
        .await
        .expect_err("a 401 must raise");
    assert!(error.to_string().contains("some message"));
}

#[tokio::test]
async fn backend_search_errors_pass_through_verbatim() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/activities/_search")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"elasticsearch": "error"}"#)
        .create_async()
        .await;

    let (status, body) = client_for(&server)
        .search_raw(
            "/activities/_search",
            &[("scroll".to_string(), "15s".to_string())],
            Vec::new(),
            "application/json",
        )
        .await
        .expect("the proxy call itself should succeed");
    assert_eq!(status.as_u16(), 401);
    assert_eq!(body, br#"{"elasticsearch": "error"}"#.to_vec());
}

#[tokio::test]
async fn searchable_total_reads_the_alias_count() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/activities/_count")
        .with_status(200)
        .with_body(r#"{"count": 249}"#)
        .create_async()
        .await;

    let total = client_for(&server)
        .searchable_total()
        .await
        .expect("count should be available");
    assert_eq!(total, 249.0);
}

#[tokio::test]
async fn an_unanswerable_metric_is_signalled_not_crashed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/activities/_count")
        .with_status(503)
        .with_body("upstream unavailable")
        .create_async()
        .await;

    assert!(client_for(&server).searchable_total().await.is_err());
}

#[tokio::test]
async fn verification_age_is_unavailable_when_nothing_is_indexed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/activities/_search")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "aggregations": {
                    "verifications_over_time": {"max_published": {"value": null}}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    assert!(client_for(&server).min_verification_age().await.is_err());
}

#[tokio::test]
async fn verification_age_counts_back_from_the_newest_activity() {
    let mut server = mockito::Server::new_async().await;
    let thirty_seconds_ago = (chrono::Utc::now().timestamp_millis() - 30_000) as f64;
    server
        .mock("GET", "/activities/_search")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "aggregations": {
                    "verifications_over_time": {"max_published": {"value": thirty_seconds_ago}}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let age = client_for(&server)
        .min_verification_age()
        .await
        .expect("age should be available");
    assert!(age >= 29.0 && age < 120.0, "age was {}", age);
}
