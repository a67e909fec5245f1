//! Shared fixtures for datapusher integration tests
//!
//! One `MockServer` plays both the file host (`GET /files/...`) and the CKAN
//! action API (`POST /api/3/action/...`).

#![allow(dead_code)]

use std::io::{Cursor, Write};

use datapusher::config::PusherConfig;
use datapusher::Job;
use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const API_KEY: &str = "test-api-key";
pub const RESOURCE_ID: &str = "5ba3a9b4-1d2c-4e8f-9a0b-2c1f3d4e5f60";

pub fn action_path(action: &str) -> String {
    format!("/api/3/action/{}", action)
}

pub fn success(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"success": true, "result": result}))
}

pub fn failure(status: u16, message: &str, error_type: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "success": false,
        "error": {"message": message, "__type": error_type}
    }))
}

/// Config with tiny retry delays so retry tests stay fast
pub fn test_config() -> PusherConfig {
    let mut config = PusherConfig::default();
    config.loader.retry_backoff_ms = 1;
    config.api_timeout_secs = 5;
    config.fetch.timeout_secs = 5;
    config
}

pub fn push_job(server: &MockServer) -> Job {
    Job::push(API_KEY, &format!("{}/", server.uri()), RESOURCE_ID)
}

pub fn resource_json(server: &MockServer, file: &str, hash: &str) -> Value {
    json!({
        "id": RESOURCE_ID,
        "package_id": "weather-stations",
        "name": "Daily temperatures",
        "url": format!("{}/files/{}", server.uri(), file),
        "format": "CSV",
        "hash": hash,
        "datastore_active": false
    })
}

pub async fn mount_resource_show(server: &MockServer, resource: Value) {
    Mock::given(method("POST"))
        .and(path(action_path("resource_show")))
        .respond_with(success(resource))
        .mount(server)
        .await;
}

pub async fn mount_file(server: &MockServer, file: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/files/{}", file)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

/// No table yet: delete reports not found
pub async fn mount_delete_missing(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(action_path("datastore_delete")))
        .respond_with(failure(404, "Not found: Resource not found", "Not Found Error"))
        .mount(server)
        .await;
}

pub async fn mount_create_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(action_path("datastore_create")))
        .respond_with(success(json!({"resource_id": RESOURCE_ID})))
        .mount(server)
        .await;
}

/// Resource, file and delete mocks for a plain CSV push
pub async fn mount_source(server: &MockServer, body: &[u8]) {
    mount_resource_show(server, resource_json(server, "data.csv", "")).await;
    mount_file(server, "data.csv", body).await;
    mount_delete_missing(server).await;
}

/// Minimal XLSX workbook with one sheet
///
/// Cells that parse as numbers are written as numeric cells, everything else
/// as inline strings.
pub fn xlsx_workbook(rows: &[&[&str]]) -> Vec<u8> {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, cell) in row.iter().enumerate() {
            let reference = format!("{}{}", (b'A' + c as u8) as char, r + 1);
            if cell.parse::<f64>().is_ok() {
                sheet.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, cell));
            } else {
                sheet.push_str(&format!(
                    r#"<c r="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    reference, cell
                ));
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let parts = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#.to_string(),
        ),
        (
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#.to_string(),
        ),
        (
            "xl/workbook.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Stations" sheetId="1" r:id="rId1"/></sheets></workbook>"#.to_string(),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#.to_string(),
        ),
        ("xl/worksheets/sheet1.xml", sheet),
    ];

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, body) in parts {
        writer.start_file(name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
