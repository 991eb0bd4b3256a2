use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::GroepsadminSettings;
use crate::error::{ApiError, Result, TaxCertError};
use crate::models::{Address, Member, MemberRecord, Person};
use crate::utils::{mask_token, normalize_name, truncate_string};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MemberList {
    #[serde(default)]
    leden: Vec<MemberListEntry>,
    #[serde(default)]
    totaal: usize,
}

#[derive(Debug, Deserialize)]
struct MemberListEntry {
    #[serde(deserialize_with = "deserialize_string_id")]
    id: String,
    #[serde(default)]
    waarden: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MemberDetail {
    #[serde(deserialize_with = "deserialize_string_id")]
    id: String,
    vgagegevens: MemberData,
    #[serde(default)]
    adressen: Vec<WireAddress>,
    #[serde(default)]
    contacten: Vec<WireContact>,
}

#[derive(Debug, Deserialize)]
struct MemberData {
    voornaam: String,
    achternaam: String,
    geboortedatum: NaiveDate,
    #[serde(default)]
    beperking: bool,
    #[serde(default)]
    verminderdlidgeld: bool,
}

#[derive(Debug, Deserialize)]
struct WireAddress {
    #[serde(default, deserialize_with = "deserialize_optional_string_id")]
    id: Option<String>,
    #[serde(default)]
    straat: String,
    #[serde(default, deserialize_with = "deserialize_optional_string_id")]
    nummer: Option<String>,
    #[serde(default)]
    bus: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_string_id")]
    postcode: Option<String>,
    #[serde(default)]
    gemeente: String,
    #[serde(default)]
    postadres: bool,
}

#[derive(Debug, Deserialize)]
struct WireContact {
    #[serde(default)]
    rol: Option<String>,
    voornaam: String,
    achternaam: String,
    #[serde(default, deserialize_with = "deserialize_optional_string_id")]
    adres: Option<String>,
}

/// A row of the member list: enough to match names before fetching details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSummary {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

impl MemberSummary {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

// Custom deserializer for string IDs that might come as numbers
fn deserialize_string_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::Number(num) => Ok(num.to_string()),
        Value::String(s) => Ok(s),
        _ => Err(serde::de::Error::custom("ID must be a string or number")),
    }
}

fn deserialize_optional_string_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::Null => Ok(None),
        Value::Number(num) => Ok(Some(num.to_string())),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(serde::de::Error::custom("expected a string or number")),
    }
}

impl WireAddress {
    fn to_address(&self) -> Address {
        let number = self.nummer.clone().unwrap_or_default();
        let street_number = match self.bus.as_deref().map(str::trim) {
            Some(bus) if !bus.is_empty() => format!("{} bus {}", number, bus),
            _ => number,
        };
        Address {
            street: self.straat.clone(),
            street_number,
            zipcode: self.postcode.clone().unwrap_or_default(),
            city: self.gemeente.clone(),
        }
    }
}

/// Picks the postal address, falling back to the first one listed.
fn primary_address(addresses: &[WireAddress]) -> Option<&WireAddress> {
    addresses
        .iter()
        .find(|address| address.postadres)
        .or_else(|| addresses.first())
}

fn column_value(values: &HashMap<String, Value>, suffix: &str) -> String {
    values
        .iter()
        .find(|(key, _)| key.ends_with(suffix))
        .and_then(|(_, value)| value.as_str())
        .unwrap_or_default()
        .trim()
        .to_string()
}

impl MemberDetail {
    fn into_record(self) -> Result<MemberRecord> {
        let address = primary_address(&self.adressen)
            .map(WireAddress::to_address)
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!("member {} has no address", self.id))
            })?;

        let parent = self.contacten.first().map(|contact| {
            let contact_address = contact
                .adres
                .as_ref()
                .and_then(|id| self.adressen.iter().find(|a| a.id.as_ref() == Some(id)))
                .map(WireAddress::to_address)
                .unwrap_or_else(|| address.clone());
            tracing::debug!(
                "Using contact {} {} ({}) as parent",
                contact.voornaam,
                contact.achternaam,
                contact.rol.as_deref().unwrap_or("unknown role")
            );
            Person {
                last_name: contact.achternaam.clone(),
                first_name: contact.voornaam.clone(),
                address: contact_address,
            }
        });

        let data = self.vgagegevens;
        let person = Person {
            last_name: data.achternaam,
            first_name: data.voornaam,
            address,
        };
        Ok(MemberRecord {
            id: self.id,
            member: Member::new(person, data.geboortedatum, data.verminderdlidgeld, data.beperking),
            parent,
        })
    }
}

pub struct GroepsadminClient {
    client: Client,
    base_url: String,
    token_url: String,
    client_id: String,
    token: Option<String>,
}

impl GroepsadminClient {
    pub fn new(settings: &GroepsadminSettings) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(GroepsadminClient {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token_url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            token: None,
        })
    }

    /// Logs in with a password grant and keeps the bearer token.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        tracing::debug!("Requesting token for {} from {}", username, self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("username", username),
                ("password", password),
            ])
            .send()
            .await?;

        if matches!(response.status(), StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            return Err(ApiError::AuthenticationFailed.into());
        }
        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("token response: {}", e)))?;

        tracing::info!(
            "Logged in to Groepsadmin as {} (token {}, valid for {}s)",
            username,
            mask_token(&token.access_token),
            token.expires_in.unwrap_or_default()
        );
        self.token = Some(token.access_token);
        Ok(())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token.as_ref().ok_or(ApiError::NotLoggedIn)?;
        tracing::debug!("GET {}", url);

        let response = self.client.get(url).bearer_auth(token).send().await?;
        let response = check_status(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("{} ({})", e, truncate_string(&body, 200))).into()
        })
    }

    /// Lists all members of the group, following the pagination.
    pub async fn list_members(&self) -> Result<Vec<MemberSummary>> {
        let mut members = Vec::new();
        loop {
            let url = format!("{}/ledenlijst?offset={}", self.base_url, members.len());
            let page: MemberList = self.get_json(&url).await?;
            let received = page.leden.len();

            members.extend(page.leden.into_iter().map(|entry| MemberSummary {
                first_name: column_value(&entry.waarden, "VoornaamColumn"),
                last_name: column_value(&entry.waarden, "AchternaamColumn"),
                id: entry.id,
            }));

            if received == 0 || members.len() >= page.totaal {
                break;
            }
        }

        tracing::info!("Groepsadmin lists {} members", members.len());
        Ok(members)
    }

    pub async fn get_member(&self, id: &str) -> Result<MemberRecord> {
        let url = format!("{}/lid/{}", self.base_url, id);
        match self.get_json::<MemberDetail>(&url).await {
            Ok(detail) => detail.into_record(),
            Err(crate::error::TaxCertError::Api(ApiError::RequestFailed(404, _))) => {
                Err(ApiError::MemberNotFound(id.to_string()).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetches the details of every listed member whose name appears in
    /// `names`. Names without a match are logged and left out.
    pub async fn fetch_directory(&self, names: &[String]) -> Result<Vec<MemberRecord>> {
        let mut by_name: HashMap<String, String> = HashMap::new();
        for summary in self.list_members().await? {
            let key = normalize_name(&summary.full_name());
            if by_name.contains_key(&key) {
                tracing::warn!("Groepsadmin lists '{}' more than once, using the first", summary.full_name());
                continue;
            }
            by_name.insert(key, summary.id);
        }

        let mut records = Vec::new();
        for name in names {
            let Some(id) = by_name.get(&normalize_name(name)) else {
                tracing::warn!("'{}' was not found in Groepsadmin", name);
                continue;
            };
            match self.get_member(id).await {
                Ok(record) => records.push(record),
                Err(TaxCertError::Api(e @ (ApiError::MemberNotFound(_) | ApiError::InvalidResponse(_)))) => {
                    tracing::warn!("Skipping '{}': {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::AuthenticationFailed.into()),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimitExceeded.into()),
        _ => {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(ApiError::RequestFailed(status.as_u16(), truncate_string(&error_text, 200)).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaxCertError;
    use mockito::Matcher;

    const MEMBER_DETAIL: &str = r#"{
        "id": "d5f75b3a",
        "vgagegevens": {
            "voornaam": "Lotte",
            "achternaam": "Peeters",
            "geboortedatum": "2011-07-07",
            "beperking": false,
            "verminderdlidgeld": true
        },
        "adressen": [
            { "id": "a1", "straat": "Kerkstraat", "nummer": 12, "bus": "3", "postcode": "9000", "gemeente": "Gent", "postadres": false },
            { "id": "a2", "straat": "Dorpsplein", "nummer": "4", "postcode": 9050, "gemeente": "Gentbrugge", "postadres": true }
        ],
        "contacten": [
            { "rol": "moeder", "voornaam": "Els", "achternaam": "Claes", "adres": "a1" }
        ]
    }"#;

    fn settings(server: &mockito::Server) -> GroepsadminSettings {
        GroepsadminSettings {
            base_url: format!("{}/rest-ga/", server.url()),
            token_url: format!("{}/token", server.url()),
            client_id: "test-client".to_string(),
            username: None,
        }
    }

    async fn logged_in(server: &mut mockito::Server) -> GroepsadminClient {
        let _token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"secret-token","expires_in":300}"#)
            .create_async()
            .await;
        let mut client = GroepsadminClient::new(&settings(server)).unwrap();
        client.login("leiding", "pw").await.unwrap();
        client
    }

    #[test]
    fn test_member_detail_into_record() {
        let detail: MemberDetail = serde_json::from_str(MEMBER_DETAIL).unwrap();
        let record = detail.into_record().unwrap();

        assert_eq!(record.id, "d5f75b3a");
        assert_eq!(record.member.full_name(), "Lotte Peeters");
        assert!(record.member.discount);
        assert!(!record.member.disability);
        assert_eq!(record.member.person.address.city, "Gentbrugge");
        assert_eq!(record.member.person.address.zipcode, "9050");

        let parent = record.parent.unwrap();
        assert_eq!(parent.full_name(), "Els Claes");
        assert_eq!(parent.address.street_number, "12 bus 3");
    }

    #[test]
    fn test_member_without_address_is_invalid() {
        let json = r#"{"id": 7, "vgagegevens": {"voornaam": "A", "achternaam": "B", "geboortedatum": "2012-01-01"}}"#;
        let detail: MemberDetail = serde_json::from_str(json).unwrap();
        assert!(detail.into_record().is_err());
    }

    #[tokio::test]
    async fn test_login_sends_password_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("client_id".into(), "test-client".into()),
                Matcher::UrlEncoded("username".into(), "leiding".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"secret-token","expires_in":300}"#)
            .create_async()
            .await;

        let mut client = GroepsadminClient::new(&settings(&server)).unwrap();
        client.login("leiding", "pw").await.unwrap();

        mock.assert_async().await;
        assert_eq!(client.token(), Some("secret-token"));
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/token")
            .with_status(401)
            .create_async()
            .await;

        let mut client = GroepsadminClient::new(&settings(&server)).unwrap();
        let result = client.login("leiding", "wrong").await;
        assert!(matches!(
            result,
            Err(TaxCertError::Api(ApiError::AuthenticationFailed))
        ));
    }

    #[tokio::test]
    async fn test_requests_require_login() {
        let server = mockito::Server::new_async().await;
        let client = GroepsadminClient::new(&settings(&server)).unwrap();
        let result = client.list_members().await;
        assert!(matches!(result, Err(TaxCertError::Api(ApiError::NotLoggedIn))));
    }

    #[tokio::test]
    async fn test_list_members_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;

        let first = server
            .mock("GET", "/rest-ga/ledenlijst")
            .match_query(Matcher::UrlEncoded("offset".into(), "0".into()))
            .match_header("authorization", "Bearer secret-token")
            .with_status(200)
            .with_body(r#"{"totaal": 2, "offset": 0, "leden": [
                {"id": "1", "waarden": {"be.vvksm.groepsadmin.model.column.VoornaamColumn": "Lotte",
                                        "be.vvksm.groepsadmin.model.column.AchternaamColumn": "Peeters"}}
            ]}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/rest-ga/ledenlijst")
            .match_query(Matcher::UrlEncoded("offset".into(), "1".into()))
            .with_status(200)
            .with_body(r#"{"totaal": 2, "offset": 1, "leden": [
                {"id": 2, "waarden": {"be.vvksm.groepsadmin.model.column.VoornaamColumn": "Jan",
                                      "be.vvksm.groepsadmin.model.column.AchternaamColumn": "De Smet"}}
            ]}"#)
            .create_async()
            .await;

        let members = client.list_members().await.unwrap();
        first.assert_async().await;
        second.assert_async().await;

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].full_name(), "Lotte Peeters");
        assert_eq!(members[1].id, "2");
    }

    #[tokio::test]
    async fn test_fetch_directory_matches_names() {
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;

        let _list = server
            .mock("GET", "/rest-ga/ledenlijst")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"totaal": 1, "leden": [
                {"id": "d5f75b3a", "waarden": {"x.VoornaamColumn": "Lotte", "x.AchternaamColumn": "Peeters"}}
            ]}"#)
            .create_async()
            .await;
        let detail = server
            .mock("GET", "/rest-ga/lid/d5f75b3a")
            .with_status(200)
            .with_body(MEMBER_DETAIL)
            .create_async()
            .await;

        let names = vec!["lotte  PEETERS".to_string(), "Onbekend Lid".to_string()];
        let records = client.fetch_directory(&names).await.unwrap();
        detail.assert_async().await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].member.full_name(), "Lotte Peeters");
    }

    const TWO_MEMBERS: &str = r#"{"totaal": 2, "leden": [
        {"id": "d5f75b3a", "waarden": {"x.VoornaamColumn": "Lotte", "x.AchternaamColumn": "Peeters"}},
        {"id": "2", "waarden": {"x.VoornaamColumn": "Jan", "x.AchternaamColumn": "De Smet"}}
    ]}"#;

    #[tokio::test]
    async fn test_fetch_directory_skips_missing_member() {
        crate::logging::init_test();
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;

        let _list = server
            .mock("GET", "/rest-ga/ledenlijst")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(TWO_MEMBERS)
            .create_async()
            .await;
        let _lotte = server
            .mock("GET", "/rest-ga/lid/d5f75b3a")
            .with_status(200)
            .with_body(MEMBER_DETAIL)
            .create_async()
            .await;
        let gone = server
            .mock("GET", "/rest-ga/lid/2")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let names = vec!["Lotte Peeters".to_string(), "Jan De Smet".to_string()];
        let records = client.fetch_directory(&names).await.unwrap();
        gone.assert_async().await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].member.full_name(), "Lotte Peeters");
    }

    #[tokio::test]
    async fn test_fetch_directory_propagates_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;

        let _list = server
            .mock("GET", "/rest-ga/ledenlijst")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(TWO_MEMBERS)
            .create_async()
            .await;
        let _lotte = server
            .mock("GET", "/rest-ga/lid/d5f75b3a")
            .with_status(429)
            .create_async()
            .await;

        let names = vec!["Lotte Peeters".to_string()];
        let result = client.fetch_directory(&names).await;
        assert!(matches!(
            result,
            Err(TaxCertError::Api(ApiError::RateLimitExceeded))
        ));
    }

    #[tokio::test]
    async fn test_get_member_not_found() {
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;
        let _detail = server
            .mock("GET", "/rest-ga/lid/missing")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let result = client.get_member("missing").await;
        assert!(matches!(
            result,
            Err(TaxCertError::Api(ApiError::MemberNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let client = logged_in(&mut server).await;
        let _detail = server
            .mock("GET", "/rest-ga/lid/1")
            .with_status(429)
            .create_async()
            .await;

        let result = client.get_member("1").await;
        assert!(matches!(
            result,
            Err(TaxCertError::Api(ApiError::RateLimitExceeded))
        ));
    }
}
