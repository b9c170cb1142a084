use assert_cmd::Command;
use assert_cmd::cargo;
use mockito::{Matcher, Mock, Server, ServerGuard};

const TENANT: &str = "contoso-tenant";
const ENTITY_ID: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

/// A command pointed at the mock server for both the authority and the
/// environment, with nothing inherited from the caller's environment.
fn dvbulk(server: &ServerGuard) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("dvbulk"));
    cmd.env_remove("DATAVERSE_URL")
        .env_remove("DATAVERSE_TENANT_ID")
        .env_remove("DATAVERSE_CLIENT_ID")
        .env_remove("DATAVERSE_CLIENT_SECRET")
        .env_remove("DATAVERSE_AUTHORITY_HOST")
        .env("DATAVERSE_URL", server.url())
        .env("DATAVERSE_TENANT_ID", TENANT)
        .env("DATAVERSE_CLIENT_ID", "client-1")
        .env("DATAVERSE_CLIENT_SECRET", "secret-1")
        .env("DATAVERSE_AUTHORITY_HOST", server.url());
    cmd
}

fn mock_token(server: &mut ServerGuard) -> Mock {
    server
        .mock("POST", format!("/{}/oauth2/v2.0/token", TENANT).as_str())
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
            Matcher::UrlEncoded("client_id".into(), "client-1".into()),
            Matcher::UrlEncoded("client_secret".into(), "secret-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token_type":"Bearer","expires_in":3599,"access_token":"tok-abc"}"#)
        .create()
}

fn mock_who_am_i(server: &mut ServerGuard, dop_hint: &str) -> Mock {
    server
        .mock("GET", "/api/data/v9.2/WhoAmI")
        .match_header("authorization", "Bearer tok-abc")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-ms-dop-hint", dop_hint)
        .with_body(
            r#"{"BusinessUnitId":"11111111-1111-1111-1111-111111111111",
                "UserId":"22222222-2222-2222-2222-222222222222",
                "OrganizationId":"33333333-3333-3333-3333-333333333333"}"#,
        )
        .create()
}

fn mock_create(server: &mut ServerGuard, hits: usize) -> Mock {
    let location = format!("{}/api/data/v9.2/accounts({})", server.url(), ENTITY_ID);
    server
        .mock("POST", "/api/data/v9.2/accounts")
        .match_header("authorization", "Bearer tok-abc")
        .match_header("odata-version", "4.0")
        .match_body(Matcher::Regex(r#"\{"name":"Record \d+"\}"#.to_string()))
        .with_status(204)
        .with_header("OData-EntityId", &location)
        .expect(hits)
        .create()
}

#[test]
fn test_missing_connection_settings() {
    Command::new(cargo::cargo_bin!("dvbulk"))
        .env_remove("DATAVERSE_URL")
        .env_remove("DATAVERSE_TENANT_ID")
        .env_remove("DATAVERSE_CLIENT_ID")
        .env_remove("DATAVERSE_CLIENT_SECRET")
        .arg("whoami")
        .assert()
        .failure()
        .stderr(predicates::str::contains("--client-secret are required"));
}

#[test]
fn test_whoami() {
    let mut server = Server::new();
    let token = mock_token(&mut server);
    let who = server
        .mock("GET", "/api/data/v9.2/WhoAmI")
        .match_header("authorization", "Bearer tok-abc")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"BusinessUnitId":"11111111-1111-1111-1111-111111111111",
                "UserId":"22222222-2222-2222-2222-222222222222",
                "OrganizationId":"33333333-3333-3333-3333-333333333333"}"#,
        )
        .create();

    dvbulk(&server)
        .arg("whoami")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "22222222-2222-2222-2222-222222222222",
        ))
        .stdout(predicates::str::contains(
            "33333333-3333-3333-3333-333333333333",
        ));

    token.assert();
    who.assert();
}

#[test]
fn test_roundtrip_creates_then_deletes() {
    let mut server = Server::new();
    let token = mock_token(&mut server);
    let who = mock_who_am_i(&mut server, "8");
    let create = mock_create(&mut server, 3);
    let delete = server
        .mock(
            "DELETE",
            format!("/api/data/v9.2/accounts({})", ENTITY_ID).as_str(),
        )
        .match_header("authorization", "Bearer tok-abc")
        .with_status(204)
        .expect(3)
        .create();

    dvbulk(&server)
        .args(["roundtrip", "--count", "3", "--concurrency", "2"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Concurrency: 2"))
        .stdout(predicates::str::contains("Created:  3/3"))
        .stdout(predicates::str::contains("Deleted:  3/3"));

    token.assert();
    who.assert();
    create.assert();
    delete.assert();
}

#[test]
fn test_roundtrip_retries_throttled_create() {
    let mut server = Server::new();
    let _token = mock_token(&mut server);
    let _who = mock_who_am_i(&mut server, "8");
    let throttled = server
        .mock("POST", "/api/data/v9.2/accounts")
        .with_status(429)
        .with_header("Retry-After", "0")
        .expect(1)
        .create();
    let create = mock_create(&mut server, 1);
    let delete = server
        .mock(
            "DELETE",
            format!("/api/data/v9.2/accounts({})", ENTITY_ID).as_str(),
        )
        .with_status(204)
        .expect(1)
        .create();

    dvbulk(&server)
        .args(["roundtrip", "--count", "1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Concurrency: 8"))
        .stdout(predicates::str::contains("Created:  1/1"));

    throttled.assert();
    create.assert();
    delete.assert();
}

#[test]
fn test_roundtrip_reports_failed_deletes() {
    let mut server = Server::new();
    let _token = mock_token(&mut server);
    let _who = mock_who_am_i(&mut server, "3");
    let _create = mock_create(&mut server, 2);
    let _delete = server
        .mock(
            "DELETE",
            format!("/api/data/v9.2/accounts({})", ENTITY_ID).as_str(),
        )
        .with_status(404)
        .with_body(r#"{"error":{"code":"0x80040217","message":"Entity does not exist"}}"#)
        .create();

    dvbulk(&server)
        .args(["roundtrip", "--count", "2", "--max-retries", "0"])
        .assert()
        .failure()
        .stdout(predicates::str::contains("Deleted:  0/2"))
        .stdout(predicates::str::contains("HTTP 404"))
        .stderr(predicates::str::contains("2 operations failed"));
}

#[test]
fn test_roundtrip_follows_service_parallelism_hint() {
    let mut server = Server::new();
    let _token = mock_token(&mut server);
    let who = mock_who_am_i(&mut server, "5");
    let create = mock_create(&mut server, 2);
    let delete = server
        .mock(
            "DELETE",
            format!("/api/data/v9.2/accounts({})", ENTITY_ID).as_str(),
        )
        .with_status(204)
        .expect(2)
        .create();

    dvbulk(&server)
        .args(["roundtrip", "--count", "2"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Concurrency: 5"));

    who.assert();
    create.assert();
    delete.assert();
}

#[test]
fn test_rejected_credentials_abort_the_run() {
    let mut server = Server::new();
    let token = server
        .mock("POST", format!("/{}/oauth2/v2.0/token", TENANT).as_str())
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret provided."}"#)
        .expect(1)
        .create();
    let create = server
        .mock("POST", "/api/data/v9.2/accounts")
        .expect(0)
        .create();

    dvbulk(&server)
        .args(["roundtrip", "--count", "5"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("Authentication failed"))
        .stderr(predicates::str::contains("invalid_client"));

    token.assert();
    create.assert();
}
