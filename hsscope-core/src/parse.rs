//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 0xプレフィックス付きの16進数、または10進数
///
/// # Examples
/// ```
/// use hsscope_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x4a1f20").unwrap(), 0x4a1f20);
/// assert_eq!(parse_address("4096").unwrap(), 4096);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// `-r -c`や`-rc`のような1文字フラグを展開する
///
/// `allowed`にないフラグやフラグでない引数はエラーの対象としてそのまま返す。
pub fn parse_flags<'a>(args: &[&'a str], allowed: &[char]) -> std::result::Result<Vec<char>, &'a str> {
    let mut flags = Vec::new();
    for &arg in args {
        let Some(letters) = arg.strip_prefix('-').filter(|l| !l.is_empty()) else {
            return Err(arg);
        };
        for c in letters.chars() {
            if !allowed.contains(&c) {
                return Err(arg);
            }
            if !flags.contains(&c) {
                flags.push(c);
            }
        }
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address(" 0xABCD ").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
        // 接頭辞のない16進数は受け付けない
        assert!(parse_address("abcd").is_err());
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags(&["-r", "-c"], &['r', 'c']), Ok(vec!['r', 'c']));
        assert_eq!(parse_flags(&["-cr"], &['r', 'c']), Ok(vec!['c', 'r']));
        assert_eq!(parse_flags(&["-r", "-r"], &['r', 'c']), Ok(vec!['r']));
        assert_eq!(parse_flags(&[], &['r']), Ok(vec![]));
        assert_eq!(parse_flags(&["-x"], &['r', 'c']), Err("-x"));
        assert_eq!(parse_flags(&["-rx"], &['r', 'c']), Err("-rx"));
        assert_eq!(parse_flags(&["r"], &['r']), Err("r"));
        assert_eq!(parse_flags(&["-"], &['r']), Err("-"));
    }
}
