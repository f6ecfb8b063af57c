//! zエンコードされたシンボル名の復元
//!
//! GHCはシンボル名に使えない文字を`z`または`Z`で始まる2文字のトークンに置き換える。
//! 参考: https://gitlab.haskell.org/ghc/ghc/-/wikis/commentary/compiler/symbol-names
//!
//! 復元は全域関数で、失敗しない。表にないトークンは2文字のまま残し、
//! 入力末尾の単独の`z`/`Z`もそのまま出力する。

/// トークン -> 復元文字列の対応表
///
/// `ZC`は`ZC`のまま残す（コンストラクタ`:`を曖昧さなく表示するため）
const TOKENS: &[(&str, &str)] = &[
    ("ZC", "ZC"),
    ("ZL", "("),
    ("ZM", "["),
    ("ZN", "]"),
    ("ZR", ")"),
    ("ZZ", "Z"),
    ("za", "&"),
    ("zb", "|"),
    ("zd", "$"),
    ("ze", "="),
    ("zg", ">"),
    ("zh", "#"),
    ("zi", "."),
    ("zl", "<"),
    ("zm", "-"),
    ("zn", "!"),
    ("zp", "+"),
    ("zq", "'"),
    ("zs", "/"),
    ("zt", "*"),
    ("zu", "_"),
    ("zz", "z"),
];

fn translate(token: &str) -> &str {
    TOKENS
        .iter()
        .find(|(from, _)| *from == token)
        .map(|(_, to)| *to)
        .unwrap_or(token)
}

/// zエンコードされた名前を復元する
///
/// # Examples
/// ```
/// use hsscope_rts::zdecode;
///
/// assert_eq!(
///     zdecode("base_TextziParserCombinatorsziReadP_zdfAlternativePzuzdczlzbzg_info"),
///     "base_Text.ParserCombinators.ReadP_$fAlternativeP_$c<|>_info"
/// );
/// ```
pub fn zdecode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(idx) = rest.find(['z', 'Z']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        // トークンは先頭文字と次の1文字（末尾なら先頭文字のみ）
        let token_len = tail
            .char_indices()
            .nth(2)
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        out.push_str(translate(&tail[..token_len]));
        rest = &tail[token_len..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_pairs() {
        let cases = [
            (
                "base_TextziParserCombinatorsziReadP_zdfAlternativePzuzdczlzbzg_info",
                "base_Text.ParserCombinators.ReadP_$fAlternativeP_$c<|>_info",
            ),
            (
                "timezm1zi9zi3_DataziTimeziLocalTimeziInternalziTimeZZone_TimeZZone_con_info",
                "time-1.9.3_Data.Time.LocalTime.Internal.TimeZone_TimeZone_con_info",
            ),
            ("ghczmprim_GHCziTypes_ZC_con_info", "ghc-prim_GHC.Types_ZC_con_info"),
            ("ZLZR", "()"),
            ("ZMZN", "[]"),
            ("zazbzezgzhzlznzpzqzsztzz", "&|=>#<!+'/*z"),
        ];
        for (mangled, expected) in cases {
            assert_eq!(zdecode(mangled), expected, "decoding {}", mangled);
        }
    }

    #[test]
    fn test_no_escape_is_identity() {
        for s in ["", "main", "stg_upd_frame_info", "Main.hs:12", "ÄÖÜ_ok"] {
            assert_eq!(zdecode(s), s);
        }
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        assert_eq!(zdecode("zx"), "zx");
        assert_eq!(zdecode("Z3T"), "Z3T");
        assert_eq!(zdecode("fooZy"), "fooZy");
    }

    #[test]
    fn test_lone_escape_at_end() {
        assert_eq!(zdecode("z"), "z");
        assert_eq!(zdecode("Z"), "Z");
        assert_eq!(zdecode("fooz"), "fooz");
        assert_eq!(zdecode("Main_zi_infoZ"), "Main_._infoZ");
    }

    #[test]
    fn test_multibyte_characters() {
        // トークンの2文字目がマルチバイト文字でも分割しない
        assert_eq!(zdecode("zé"), "zé");
        assert_eq!(zdecode("ñzdñ"), "ñ$ñ");
        assert_eq!(zdecode("Zé漢"), "Zé漢");
    }

    #[test]
    fn test_total_on_arbitrary_bytes() {
        let samples: Vec<Vec<u8>> = vec![
            vec![0xff, b'z', 0xfe],
            vec![b'z', 0x00, b'Z'],
            (0u8..=255).collect(),
            b"zzzzz".to_vec(),
        ];
        for bytes in samples {
            let s = String::from_utf8_lossy(&bytes);
            let _ = zdecode(&s);
        }
        assert_eq!(zdecode("zzzzz"), "zzz");
    }
}
