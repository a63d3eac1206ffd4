use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::config::EtranConfig;

/// Train index as three parts: `12345-678-54321` (any non-digit separator).
static TRAIN_INDEX_PARTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{5})\D(\d{3})\D(\d{5})$").unwrap());
/// Train index already normalized to 15 digits.
static TRAIN_INDEX_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{15}$").unwrap());
/// Comma-separated 8-digit car numbers.
static CAR_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}(,\d{8})*$").unwrap());
/// Numeric organization id.
static ORG_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,12}$").unwrap());

/// A rejected row. Both variants are terminal: the row is acked as an error
/// so it is never claimed again.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    #[error("Неизвестный тип запроса: {type_id}")]
    UnknownType { type_id: i32 },
    #[error("Некорректный формат индекса поезда: {query}")]
    BadTrainIndex { query: String },
    #[error("Некорректный список номеров вагонов: {query}")]
    BadCarNumbers { query: String },
    #[error("Некорректный запрос справочника НСИ: {query}")]
    BadNsiQuery { query: String },
    #[error("Некорректный идентификатор организации: {query}")]
    BadOrgId { query: String },
}

/// Escape the inner request for embedding into the envelope's `<Text>`.
/// The upstream expects exactly these four entities.
pub fn xml_escape(val: &str) -> String {
    val.replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Six-digit station code with a check digit ("code-6") computed from a
/// five-digit code: weighted digit sum mod 11 with weights 5..1; on a
/// remainder of 10 retry with weights 7..3; if still 10 the digit is 0.
pub fn code6(val: u32) -> String {
    let mut digit = weighted_sum_mod11(val, [5, 4, 3, 2, 1]);
    if digit == 10 {
        digit = weighted_sum_mod11(val, [7, 6, 5, 4, 3]);
        if digit == 10 {
            digit = 0;
        }
    }
    format!("{:06}", val * 10 + digit)
}

// Weights apply to the decimal digits lowest-first.
fn weighted_sum_mod11(mut n: u32, weights: [u32; 5]) -> u32 {
    let mut sum = 0;
    for weight in weights {
        sum += n % 10 * weight;
        n /= 10;
    }
    sum % 11
}

/// The request-body builders, a tagged dispatch on the DB row's `TypeID`.
///
/// Every builder validates the row's free-form `Query` against its own
/// format and produces the inner request XML, which [`build`] then wraps
/// into the constant `GetBlock` envelope with the configured credentials.
///
/// [`build`]: RequestCatalog::build
pub struct RequestCatalog {
    login: String,
    password: String,
    gzip: bool,
}

impl RequestCatalog {
    pub fn new(config: &EtranConfig) -> Self {
        Self {
            login: config.login.clone(),
            password: config.password.clone(),
            gzip: config.gzip,
        }
    }

    /// Build the full SOAP envelope for one DB row.
    pub fn build(
        &self,
        type_id: i32,
        query: &str,
    ) -> Result<String, BuildError> {
        let query = query.trim();
        let inner = match type_id {
            1 => self.train_dislocation(query)?,
            2 => self.car_dislocation(query)?,
            101 => self.nsi_reference(query)?,
            102 => org_passport(query)?,
            _ => return Err(BuildError::UnknownType { type_id }),
        };
        Ok(self.envelope(&inner))
    }

    fn envelope(&self, inner: &str) -> String {
        format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sys="SysEtranInt">
<soapenv:Body>
    <sys:GetBlock>
        <Login>{login}</Login>
        <Password>{password}</Password>
        <Text>{text}</Text>
    </sys:GetBlock>
</soapenv:Body>
</soapenv:Envelope>"#,
            login = self.login,
            password = self.password,
            text = xml_escape(inner),
        )
    }

    /// `GetInform` carrier around an ASOUP reference request. With the gzip
    /// flag set the upstream is asked to pack the payload into the
    /// base64+gzip `ASOUP64Reply` carrier.
    fn get_inform(&self, carrier: &str, request: &str) -> String {
        let gzip = if self.gzip {
            "\n<UseGZIPBinary>1</UseGZIPBinary>"
        } else {
            ""
        };
        format!("<{carrier}>{gzip}\n{request}\n</{carrier}>")
    }

    /// Работа с поездом: dislocation by train index (type 1).
    fn train_dislocation(&self, query: &str) -> Result<String, BuildError> {
        let index = if let Some(m) = TRAIN_INDEX_PARTS.captures(query) {
            let head: u32 = m[1].parse().expect("regex allows only digits");
            let tail: u32 = m[3].parse().expect("regex allows only digits");
            format!("{}{}{}", code6(head), &m[2], code6(tail))
        } else if TRAIN_INDEX_FULL.is_match(query) {
            query.to_owned()
        } else {
            return Err(BuildError::BadTrainIndex {
                query: query.to_owned(),
            });
        };

        let request = format!(
            r#"<ns0:getReferenceSPP4700 xmlns:ns0="http://service.siw.pktbcki.rzd/">
<ns0:ReferenceSPP4700Request>
<idUser>0</idUser>
<indexPoezd>{index}</indexPoezd>
</ns0:ReferenceSPP4700Request>
</ns0:getReferenceSPP4700>"#
        );
        Ok(self.get_inform("GetInform", &request))
    }

    /// Дислокация вагонов: car dislocation by car numbers (type 2).
    fn car_dislocation(&self, query: &str) -> Result<String, BuildError> {
        if !CAR_NUMBERS.is_match(query) {
            return Err(BuildError::BadCarNumbers {
                query: query.to_owned(),
            });
        }

        let cars = query
            .split(',')
            .map(|car| format!("<nomVagon>{car}</nomVagon>"))
            .collect::<Vec<_>>()
            .join("\n");
        let request = format!(
            r#"<ns0:getReferenceSPV4669 xmlns:ns0="http://service.siw.pktbcki.rzd/">
<ns0:ReferenceSPV4669Request>
<idUser>0</idUser>
{cars}
</ns0:ReferenceSPV4669Request>
</ns0:getReferenceSPV4669>"#
        );
        Ok(self.get_inform("GetInform", &request))
    }

    /// Справочник НСИ: NSI reference lookup (type 101). The query is
    /// `key=value` pairs separated by `;`; `table` is mandatory, `code` and
    /// `name` narrow the lookup.
    fn nsi_reference(&self, query: &str) -> Result<String, BuildError> {
        let bad = || BuildError::BadNsiQuery {
            query: query.to_owned(),
        };

        let mut table = None;
        let mut code = None;
        let mut name = None;
        for pair in query.split(';').map(str::trim).filter(|p| !p.is_empty())
        {
            let (key, value) = pair.split_once('=').ok_or_else(bad)?;
            let value = value.trim();
            if value.is_empty() {
                return Err(bad());
            }
            match key.trim() {
                "table" => table = Some(value),
                "code" => code = Some(value),
                "name" => name = Some(value),
                _ => return Err(bad()),
            }
        }
        let table = table.ok_or_else(bad)?;

        let mut fields = format!("<table>{}</table>", xml_escape(table));
        if let Some(code) = code {
            fields.push_str(&format!("<code>{}</code>", xml_escape(code)));
        }
        if let Some(name) = name {
            fields.push_str(&format!("<name>{}</name>", xml_escape(name)));
        }
        let request = format!(
            r#"<ns0:getNSI xmlns:ns0="http://service.siw.pktbcki.rzd/">
<ns0:NSIRequest>
{fields}
</ns0:NSIRequest>
</ns0:getNSI>"#
        );
        Ok(self.get_inform("GetInformNSI", &request))
    }
}

/// Паспорт организации: organization passport by id (type 102). Answered
/// by the upstream directly, without the ASOUP carrier.
fn org_passport(query: &str) -> Result<String, BuildError> {
    if !ORG_ID.is_match(query) {
        return Err(BuildError::BadOrgId {
            query: query.to_owned(),
        });
    }
    Ok(format!("<getOrgPassport>\n<idOrg>{query}</idOrg>\n</getOrgPassport>"))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn catalog(gzip: bool) -> RequestCatalog {
        RequestCatalog {
            login: "user1".to_owned(),
            password: "pass1".to_owned(),
            gzip,
        }
    }

    #[test]
    fn code6_known_vectors() {
        // 5*5 + 4*4 + 3*3 + 2*2 + 1*1 = 55, 55 % 11 = 0.
        assert_eq!(code6(12345), "123450");
        // First pass remainder 10, second pass 14 % 11 = 3.
        assert_eq!(code6(2), "000023");
        // Both passes give 10, so the check digit is 0.
        assert_eq!(code6(80021), "800210");
    }

    #[test]
    fn code6_is_always_six_digits() {
        for val in [0, 1, 9, 99, 12345, 54321, 80021, 99999] {
            let code = code6(val);
            assert_eq!(code.len(), 6, "code6({val}) = {code}");
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn xml_escape_covers_the_four_entities() {
        assert_eq!(
            xml_escape(r#"<a b="c">'d'</a>"#),
            "&lt;a b=&quot;c&quot;&gt;&apos;d&apos;&lt;/a&gt;"
        );
    }

    proptest! {
        // Escape must round-trip through a standard XML unescape. `&` is
        // deliberately left alone by the upstream's convention, so inputs
        // containing it are out of scope.
        #[test]
        fn xml_escape_round_trips(raw in "[^&]*") {
            let escaped = xml_escape(&raw);
            let unescaped = quick_xml::escape::unescape(&escaped).unwrap();
            prop_assert_eq!(unescaped.into_owned(), raw);
        }
    }

    #[test]
    fn train_index_is_normalized_via_code6() {
        let body = catalog(false).build(1, "12345-678-54321").unwrap();
        // 12345 -> 123450, 54321 -> check digit 5*1+4*2+3*3+2*4+1*5 = 35 % 11 = 2.
        assert!(body.contains("123450678543212"));
        assert!(body.contains("&lt;indexPoezd&gt;"));
    }

    #[test]
    fn full_train_index_is_passed_through() {
        let body = catalog(false).build(1, "123450678543212").unwrap();
        assert!(body.contains("123450678543212"));
    }

    #[test]
    fn bad_train_index_is_rejected() {
        let err = catalog(false).build(1, "abc").unwrap_err();
        assert_eq!(
            err,
            BuildError::BadTrainIndex { query: "abc".to_owned() }
        );
        assert_eq!(
            err.to_string(),
            "Некорректный формат индекса поезда: abc"
        );
    }

    #[test]
    fn envelope_wraps_and_escapes_the_request() {
        let body = catalog(false).build(1, "12345-678-54321").unwrap();
        assert!(body.starts_with("<soapenv:Envelope"));
        assert!(body.contains("<sys:GetBlock>"));
        assert!(body.contains("<Login>user1</Login>"));
        assert!(body.contains("<Password>pass1</Password>"));
        // The inner request is escaped, never raw.
        assert!(body.contains("&lt;GetInform&gt;"));
        assert!(!body.contains("<GetInform>"));
    }

    #[test]
    fn gzip_flag_asks_for_the_packed_carrier() {
        let plain = catalog(false).build(1, "12345-678-54321").unwrap();
        let packed = catalog(true).build(1, "12345-678-54321").unwrap();
        assert!(!plain.contains("UseGZIPBinary"));
        assert!(packed.contains("&lt;UseGZIPBinary&gt;1&lt;/UseGZIPBinary&gt;"));
    }

    #[test]
    fn car_numbers_build_one_element_each() {
        let body = catalog(false).build(2, "12345678,87654321").unwrap();
        assert!(body.contains("&lt;nomVagon&gt;12345678&lt;/nomVagon&gt;"));
        assert!(body.contains("&lt;nomVagon&gt;87654321&lt;/nomVagon&gt;"));
    }

    #[test]
    fn car_numbers_validate_digits_and_width() {
        let catalog = catalog(false);
        assert!(catalog.build(2, "1234567").is_err());
        assert!(catalog.build(2, "12345678,").is_err());
        assert!(catalog.build(2, "12345678;87654321").is_err());
    }

    #[test]
    fn nsi_query_requires_a_table() {
        let catalog = catalog(false);

        let body = catalog.build(101, "table=station;code=200007").unwrap();
        assert!(body.contains("&lt;table&gt;station&lt;/table&gt;"));
        assert!(body.contains("&lt;code&gt;200007&lt;/code&gt;"));
        assert!(body.contains("&lt;GetInformNSI&gt;"));

        assert!(catalog.build(101, "code=200007").is_err());
        assert!(catalog.build(101, "table=station;bogus=1").is_err());
        assert!(catalog.build(101, "table=").is_err());
        assert!(catalog.build(101, "station").is_err());
    }

    #[test]
    fn org_passport_takes_a_numeric_id() {
        let body = catalog(false).build(102, "4049").unwrap();
        assert!(body.contains("&lt;idOrg&gt;4049&lt;/idOrg&gt;"));
        // No ASOUP carrier for passport lookups.
        assert!(!body.contains("GetInform"));

        assert!(catalog(false).build(102, "40-49").is_err());
        assert!(catalog(false).build(102, "").is_err());
    }

    #[test]
    fn unknown_type_is_terminal() {
        let err = catalog(false).build(999, "whatever").unwrap_err();
        assert_eq!(err, BuildError::UnknownType { type_id: 999 });
        assert_eq!(err.to_string(), "Неизвестный тип запроса: 999");
    }

    #[test]
    fn builders_are_deterministic() {
        let catalog = catalog(true);
        let a = catalog.build(1, "12345-678-54321").unwrap();
        let b = catalog.build(1, "12345-678-54321").unwrap();
        assert_eq!(a, b);
    }
}
