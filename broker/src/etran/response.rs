use std::io::Read;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;

use super::xml::{self, Element};

/// The decoded upstream verdict for one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Decoded {
    pub is_error: bool,
    pub text: String,
}

impl Decoded {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            text: text.into(),
        }
    }

    fn ok(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            text: text.into(),
        }
    }
}

/// Decode a raw upstream HTTP response body.
///
/// A pure function: any malformed input comes back as an error verdict with
/// a diagnostic instead of panicking or touching shared state. The outer
/// envelope's declared encoding is honored (the upstream really does send
/// legacy code pages); the inner document's declaration is a lie and is
/// always reinterpreted as UTF-8.
pub fn decode_response(body: &[u8]) -> Decoded {
    if body.is_empty() {
        return Decoded::error("empty response");
    }
    match try_decode(body) {
        Ok(decoded) => decoded,
        Err(e) => Decoded::error(format!("{e:#}")),
    }
}

fn try_decode(body: &[u8]) -> anyhow::Result<Decoded> {
    let outer = xml::parse_bytes(body).context("outer envelope")?;

    // Envelope/Body/GetBlockResponse/Text
    let text = outer
        .child("Body")
        .and_then(|body| body.child("GetBlockResponse"))
        .and_then(|response| response.child("Text"))
        .map(|text| text.text.trim().to_owned())
        .context("no Envelope/Body/GetBlockResponse/Text")?;

    let inner = xml::parse_str(&text).context("inner document")?;
    match inner.local_name() {
        // Upstream-level rejection, e.g. auth failures, rate limiting, 504s.
        "error" => {
            let code = inner.attr("errorStatusCode").unwrap_or_default();
            let message = inner.attr("errorMessage").unwrap_or_default();
            Ok(Decoded::error(format!("{code} {message}")))
        }
        // A carrier for a second, ASOUP-level envelope.
        "GetInformReply" | "GetInformNSIReply" => decode_asoup(&inner),
        // getNSIReply, getOrgPassportReply, etc. are the payload themselves.
        _ => Ok(Decoded::ok(inner.to_xml())),
    }
}

/// Unwrap the ASOUP envelope out of a `GetInform*Reply` carrier: inline XML
/// in `ASOUPReply`, or base64-over-gzip in `ASOUP64Reply`.
fn decode_asoup(reply: &Element) -> anyhow::Result<Decoded> {
    let inline = reply
        .child_text("ASOUPReply")
        .filter(|text| !text.is_empty());
    let payload = match inline {
        Some(text) => text.as_bytes().to_vec(),
        None => {
            let packed = reply
                .child_text("ASOUP64Reply")
                .filter(|text| !text.is_empty())
                .context("both ASOUPReply and ASOUP64Reply are empty")?;
            // Tolerate line-wrapped base64.
            let packed = packed.split_whitespace().collect::<String>();
            let compressed = BASE64
                .decode(packed)
                .context("ASOUP64Reply is not valid base64")?;
            let mut payload = Vec::new();
            GzDecoder::new(compressed.as_slice())
                .read_to_end(&mut payload)
                .context("ASOUP64Reply is not valid gzip")?;
            payload
        }
    };

    // Envelope/Body/<operation>Response/return. Like the inner document,
    // the ASOUP envelope's declared encoding is a lie; force UTF-8.
    let payload = String::from_utf8_lossy(&payload);
    let envelope = xml::parse_str(&payload).context("ASOUP envelope")?;
    let ret = envelope
        .child("Body")
        .and_then(|body| body.children.first())
        .and_then(|response| response.child("return"))
        .context("no Envelope/Body/*/return in the ASOUP envelope")?;

    if ret.child_text("returnCode") != Some("0") {
        let message = ret.child_text("errorMessage").unwrap_or_default();
        return Ok(Decoded::error(message));
    }

    // The first child of <return> is the reference payload. Rename it to
    // <root> and drop the namespace clutter from the opening tag.
    let mut payload = ret
        .children
        .first()
        .cloned()
        .context("ASOUP return has no payload element")?;
    payload.name = "root".to_owned();
    Ok(Decoded::ok(payload.to_xml_without_root_attrs()))
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use super::*;

    /// Standard XML escaping, the way the upstream escapes nested payloads
    /// (unlike the four-entity request convention, `&` is escaped too, so
    /// nesting levels stay apart).
    fn esc(raw: &str) -> String {
        quick_xml::escape::escape(raw).into_owned()
    }

    /// Wrap `inner` into the outer `GetBlockResponse` envelope the upstream
    /// answers with.
    fn outer_envelope(inner: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Body><GetBlockResponse><Text>{}</Text></GetBlockResponse></soapenv:Body></soapenv:Envelope>"#,
            esc(inner)
        )
        .into_bytes()
    }

    /// An ASOUP envelope with a `getReferenceSPP4700Response` carrying the
    /// given `<return>` children.
    fn asoup_envelope(return_children: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="windows-1251"?><S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Body><ns2:getReferenceSPP4700Response xmlns:ns2="http://service.siw.pktbcki.rzd/"><return>{return_children}</return></ns2:getReferenceSPP4700Response></S:Body></S:Envelope>"#
        )
    }

    const SUCCESS_RETURN: &str = r#"<ns2:referenceSPP4700 xmlns:ns2="http://service.siw.pktbcki.rzd/"><row indexPoezd="123450678543212"/></ns2:referenceSPP4700><returnCode>0</returnCode>"#;

    #[test]
    fn success_with_inline_asoup_reply() {
        let reply = format!(
            "<GetInformReply><ASOUPReply>{}</ASOUPReply></GetInformReply>",
            esc(&asoup_envelope(SUCCESS_RETURN))
        );
        let decoded = decode_response(&outer_envelope(&reply));

        assert!(!decoded.is_error);
        assert_eq!(
            decoded.text,
            r#"<root><row indexPoezd="123450678543212"/></root>"#
        );
    }

    #[test]
    fn success_with_base64_gzip_carrier() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(asoup_envelope(SUCCESS_RETURN).as_bytes())
            .unwrap();
        let packed = BASE64.encode(encoder.finish().unwrap());

        let reply = format!(
            "<GetInformReply><ASOUPReply/><ASOUP64Reply>{packed}</ASOUP64Reply></GetInformReply>"
        );
        let decoded = decode_response(&outer_envelope(&reply));

        assert!(!decoded.is_error);
        assert_eq!(
            decoded.text,
            r#"<root><row indexPoezd="123450678543212"/></root>"#
        );
    }

    #[test]
    fn upstream_error_joins_code_and_message() {
        let reply = r#"<error errorStatusCode="400" errorMessage="Дождитесь окончания предыдущего запроса от 10.0.0.1"/>"#;
        let decoded = decode_response(&outer_envelope(reply));

        assert!(decoded.is_error);
        assert_eq!(
            decoded.text,
            "400 Дождитесь окончания предыдущего запроса от 10.0.0.1"
        );
    }

    #[test]
    fn outage_error_starts_with_504() {
        let reply = r#"<error errorStatusCode="504" errorMessage="Сервис недоступен"/>"#;
        let decoded = decode_response(&outer_envelope(reply));

        assert!(decoded.is_error);
        assert!(decoded.text.starts_with("504"));
    }

    #[test]
    fn nonzero_return_code_is_an_error() {
        let children = r#"<returnCode>1</returnCode><errorMessage>нет данных</errorMessage>"#;
        let reply = format!(
            "<GetInformReply><ASOUPReply>{}</ASOUPReply></GetInformReply>",
            esc(&asoup_envelope(children))
        );
        let decoded = decode_response(&outer_envelope(&reply));

        assert!(decoded.is_error);
        assert_eq!(decoded.text, "нет данных");
    }

    #[test]
    fn nsi_carrier_is_unwrapped_too() {
        let reply = format!(
            "<GetInformNSIReply><ASOUPReply>{}</ASOUPReply></GetInformNSIReply>",
            esc(&asoup_envelope(SUCCESS_RETURN))
        );
        let decoded = decode_response(&outer_envelope(&reply));
        assert!(!decoded.is_error);
        assert!(decoded.text.starts_with("<root>"));
    }

    #[test]
    fn other_root_tags_pass_through_as_payload() {
        let reply =
            "<getOrgPassportReply><org><name>РЖД</name></org></getOrgPassportReply>";
        let decoded = decode_response(&outer_envelope(reply));

        assert!(!decoded.is_error);
        assert_eq!(
            decoded.text,
            "<getOrgPassportReply><org><name>РЖД</name></org></getOrgPassportReply>"
        );
    }

    #[test]
    fn legacy_encoded_outer_envelope_is_decoded() {
        let reply = r#"<error errorStatusCode="400" errorMessage="Дождитесь окончания предыдущего запроса от 10.0.0.1"/>"#;
        let utf8 = String::from_utf8(outer_envelope(reply)).unwrap();
        let relabeled =
            utf8.replace("encoding=\"UTF-8\"", "encoding=\"windows-1251\"");
        let (encoded, _, _) = encoding_rs::WINDOWS_1251.encode(&relabeled);
        assert!(std::str::from_utf8(&encoded).is_err());

        let decoded = decode_response(&encoded);
        assert!(decoded.is_error);
        assert!(decoded
            .text
            .starts_with("400 Дождитесь окончания предыдущего запроса"));
    }

    #[test]
    fn empty_body_is_an_application_error() {
        let decoded = decode_response(b"");
        assert!(decoded.is_error);
        assert_eq!(decoded.text, "empty response");
    }

    #[test]
    fn garbage_is_an_error_with_a_diagnostic() {
        let decoded = decode_response(b"HTTP 200 but not xml");
        assert!(decoded.is_error);
        assert!(!decoded.text.is_empty());
    }

    #[test]
    fn missing_text_element_is_an_error() {
        let decoded =
            decode_response(b"<Envelope><Body><Nothing/></Body></Envelope>");
        assert!(decoded.is_error);
        assert!(decoded.text.contains("GetBlockResponse"));
    }

    #[test]
    fn bad_base64_carrier_is_an_error() {
        let reply = "<GetInformReply><ASOUPReply/><ASOUP64Reply>###</ASOUP64Reply></GetInformReply>";
        let decoded = decode_response(&outer_envelope(reply));
        assert!(decoded.is_error);
        assert!(decoded.text.contains("base64"));
    }

    #[test]
    fn decoder_is_deterministic() {
        let reply = r#"<error errorStatusCode="504" errorMessage="x"/>"#;
        let body = outer_envelope(reply);
        assert_eq!(decode_response(&body), decode_response(&body));
    }
}
