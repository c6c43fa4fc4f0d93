//! Typed collection handles against a mocked PocketBase.

use pretty_assertions::assert_eq;
use threadline_pb::{
    CollectionRecord, Filter, ListOptions, PbError, PocketBase, PocketBaseClient, ThreadValues,
};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pocketbase(uri: String) -> PocketBase {
    PocketBase::new(PocketBaseClient::builder(uri).max_retries(0).build())
}

fn thread_json(id: &str, resolved: bool) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "collectionId": "pbc_threads",
        "collectionName": "threads",
        "created": "2024-11-03 14:05:09.123Z",
        "updated": "2024-11-03 14:05:09.123Z",
        "attachments": [],
        "author": "u1",
        "content": "<p>body</p>",
        "resolved": resolved,
        "title": "Build fails on CI",
        "expand": {
            "author": {
                "id": "u1",
                "collectionId": "_pb_users_auth_",
                "collectionName": "users",
                "username": "ada",
                "name": "Ada"
            }
        }
    })
}

#[tokio::test]
async fn resolve_thread_patches_only_resolved() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/api/collections/threads/records/t1"))
        .and(body_json(serde_json::json!({ "resolved": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(thread_json("t1", true)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let pb = pocketbase(mock_server.uri());
    let values = ThreadValues {
        resolved: Some(true),
        ..Default::default()
    };
    let thread = pb.threads().update("t1", &values).await.unwrap();

    assert!(thread.resolved);
    assert_eq!(thread.id(), "t1");
    let author = thread.expand.and_then(|e| e.author).unwrap();
    assert_eq!(author.display_name(), Some("Ada"));
}

#[tokio::test]
async fn notebook_lookup_by_author_filter() {
    let mock_server = MockServer::start().await;
    let filter = Filter::new("author = {:author}").bind("author", "u1").render();

    Mock::given(method("GET"))
        .and(path("/api/collections/notebooks/records"))
        .and(query_param("filter", "author = 'u1'"))
        .and(query_param("perPage", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "page": 1,
            "perPage": 1,
            "totalItems": 1,
            "totalPages": 1,
            "items": [{
                "id": "n1",
                "collectionId": "pbc_notebooks",
                "collectionName": "notebooks",
                "author": "u1",
                "content": "<h1>Notes</h1>"
            }]
        })))
        .mount(&mock_server)
        .await;

    let pb = pocketbase(mock_server.uri());
    let notebook = pb
        .notebooks()
        .get_first_list_item(&filter, &ListOptions::new())
        .await
        .unwrap();

    assert_eq!(notebook.id(), "n1");
    assert_eq!(notebook.content, "<h1>Notes</h1>");
}

#[tokio::test]
async fn missing_thread_is_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/collections/threads/records/nope"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "status": 404,
            "message": "The requested resource wasn't found.",
            "data": {}
        })))
        .mount(&mock_server)
        .await;

    let pb = pocketbase(mock_server.uri());
    let err = pb
        .threads()
        .get_one("nope", &Default::default())
        .await
        .unwrap_err();

    match err {
        PbError::NotFound { collection, id } => {
            assert_eq!(collection, "threads");
            assert_eq!(id, "nope");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn full_list_walks_every_page() {
    let mock_server = MockServer::start().await;

    let first: Vec<_> = (0..200).map(|i| thread_json(&format!("t{}", i), false)).collect();
    Mock::given(method("GET"))
        .and(path("/api/collections/threads/records"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "page": 1,
            "perPage": 200,
            "totalItems": 201,
            "totalPages": 2,
            "items": first
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/collections/threads/records"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "page": 2,
            "perPage": 200,
            "totalItems": 201,
            "totalPages": 2,
            "items": [thread_json("t200", true)]
        })))
        .mount(&mock_server)
        .await;

    let pb = pocketbase(mock_server.uri());
    let threads = pb.threads().get_full_list(&ListOptions::new()).await.unwrap();

    assert_eq!(threads.len(), 201);
    assert_eq!(threads.last().map(|t| t.id()), Some("t200"));
}
