mod common;

use anyhow::{Context, Result};
use axum::http::{Method, StatusCode};
use common::{acquire_db_lock, body_json, data_id, Form, TestApp};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn new_documents_notify_everyone_but_the_creator() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_role("admin", "admin").await?;
    let (_, clerk) = app.user_with_role("clerk", "data_entry").await?;
    let (_, archivist) = app.user_with_role("keeper", "archivist").await?;
    let category = app.create_category("General", &admin).await?;

    let form = Form::new()
        .text("title", "Urgent directive")
        .text("type", "incoming")
        .text("priority", "urgent")
        .text("category", &category.to_string());
    let response = app
        .send_form(Method::POST, "/api/documents", form, &clerk)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let document = data_id(&body_json(response).await?)?;

    let body = body_json(app.get("/api/notifications", Some(&clerk)).await?).await?;
    assert_eq!(body["total"], 0);

    let body = body_json(app.get("/api/notifications", Some(&admin)).await?).await?;
    assert_eq!(body["total"], 1);
    assert_eq!(body["unread_count"], 1);
    let notification = &body["data"][0];
    assert_eq!(notification["type"], "new_document");
    assert_eq!(notification["priority"], "high");
    assert_eq!(notification["is_read"], false);
    assert_eq!(
        notification["message"],
        "A new document was added: Urgent directive"
    );
    assert_eq!(
        notification["related_document"]["id"],
        json!(document.to_string())
    );
    let admin_notification = notification["id"]
        .as_str()
        .context("notification id missing")?
        .to_string();

    let response = app
        .put(
            &format!("/api/notifications/{admin_notification}/read"),
            Some(&archivist),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .put(
            &format!("/api/notifications/{admin_notification}/read"),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["data"]["is_read"], true);
    assert!(body["data"]["read_at"].is_string());

    let body = body_json(app.get("/api/notifications?unread_only=true", Some(&admin)).await?)
        .await?;
    assert_eq!(body["total"], 0);

    let body = body_json(app.get("/api/notifications", Some(&archivist)).await?).await?;
    assert_eq!(body["unread_count"], 1);

    Ok(())
}

#[tokio::test]
async fn bulk_actions_only_touch_the_caller() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_role("admin", "admin").await?;
    let (_, clerk) = app.user_with_role("clerk", "data_entry").await?;

    let response = app
        .post_json(
            "/api/notifications",
            &json!({
                "recipients": "all",
                "title": "Maintenance",
                "message": "The archive is read-only tonight"
            }),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await?;
    assert_eq!(body["count"], 2);

    let response = app.put("/api/notifications/read-all", Some(&clerk)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["count"], 1);

    let body = body_json(app.get("/api/notifications", Some(&admin)).await?).await?;
    assert_eq!(body["unread_count"], 1);
    assert_eq!(body["data"][0]["type"], "system");

    let response = app.delete("/api/notifications/clear-read", Some(&clerk)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["count"], 1);

    let body = body_json(app.get("/api/notifications", Some(&clerk)).await?).await?;
    assert_eq!(body["total"], 0);
    let body = body_json(app.get("/api/notifications", Some(&admin)).await?).await?;
    assert_eq!(body["total"], 1);

    let admin_notification = body["data"][0]["id"]
        .as_str()
        .context("notification id missing")?
        .to_string();
    let response = app
        .delete(
            &format!("/api/notifications/{admin_notification}"),
            Some(&clerk),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .delete(
            &format!("/api/notifications/{admin_notification}"),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn broadcasts_validate_their_input() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, admin) = app.user_with_role("admin", "admin").await?;
    let (clerk_id, clerk) = app.user_with_role("clerk", "data_entry").await?;

    let response = app
        .post_json(
            "/api/notifications",
            &json!({ "recipients": "all", "title": "Hi", "message": "Hello" }),
            Some(&clerk),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .post_json(
            "/api/notifications",
            &json!({
                "recipients": [clerk_id],
                "title": "Reminder",
                "message": "Please file the March invoices",
                "type": "reminder",
                "priority": "low"
            }),
            Some(&admin),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await?;
    assert_eq!(body["count"], 1);

    let body = body_json(app.get("/api/notifications", Some(&clerk)).await?).await?;
    assert_eq!(body["data"][0]["type"], "reminder");
    assert_eq!(body["data"][0]["priority"], "low");

    for payload in [
        json!({ "recipients": [Uuid::new_v4()], "title": "x", "message": "y" }),
        json!({ "recipients": [], "title": "x", "message": "y" }),
        json!({ "recipients": "everyone", "title": "x", "message": "y" }),
        json!({ "recipients": "all", "title": "x", "message": "y", "type": "gossip" }),
        json!({ "recipients": "all", "title": " ", "message": "y" }),
        json!({ "recipients": "all", "title": "x", "message": "y", "related_document": Uuid::new_v4() }),
    ] {
        let response = app
            .post_json("/api/notifications", &payload, Some(&admin))
            .await?;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "payload {payload} should be rejected"
        );
    }

    Ok(())
}
