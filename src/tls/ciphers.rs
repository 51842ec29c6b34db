//! Cipher suite catalog used to enumerate capability probes.

use super::ProtocolVersion;

pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: u16 = 0x00ff;
pub const TLS_FALLBACK_SCSV: u16 = 0x5600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    tls13: bool,
    tls12_only: bool,
}

const fn legacy(id: u16, name: &'static str) -> CipherSuite {
    CipherSuite {
        id,
        name,
        tls13: false,
        tls12_only: false,
    }
}

const fn tls12(id: u16, name: &'static str) -> CipherSuite {
    CipherSuite {
        id,
        name,
        tls13: false,
        tls12_only: true,
    }
}

const fn tls13(id: u16, name: &'static str) -> CipherSuite {
    CipherSuite {
        id,
        name,
        tls13: true,
        tls12_only: false,
    }
}

pub static CIPHER_SUITES: &[CipherSuite] = &[
    tls13(0x1301, "TLS_AES_128_GCM_SHA256"),
    tls13(0x1302, "TLS_AES_256_GCM_SHA384"),
    tls13(0x1303, "TLS_CHACHA20_POLY1305_SHA256"),
    tls13(0x1304, "TLS_AES_128_CCM_SHA256"),
    tls13(0x1305, "TLS_AES_128_CCM_8_SHA256"),
    legacy(0x0001, "TLS_RSA_WITH_NULL_MD5"),
    legacy(0x0002, "TLS_RSA_WITH_NULL_SHA"),
    legacy(0x0003, "TLS_RSA_EXPORT_WITH_RC4_40_MD5"),
    legacy(0x0004, "TLS_RSA_WITH_RC4_128_MD5"),
    legacy(0x0005, "TLS_RSA_WITH_RC4_128_SHA"),
    legacy(0x0006, "TLS_RSA_EXPORT_WITH_RC2_CBC_40_MD5"),
    legacy(0x0008, "TLS_RSA_EXPORT_WITH_DES40_CBC_SHA"),
    legacy(0x0009, "TLS_RSA_WITH_DES_CBC_SHA"),
    legacy(0x000a, "TLS_RSA_WITH_3DES_EDE_CBC_SHA"),
    legacy(0x0014, "TLS_DHE_RSA_EXPORT_WITH_DES40_CBC_SHA"),
    legacy(0x0016, "TLS_DHE_RSA_WITH_3DES_EDE_CBC_SHA"),
    legacy(0x0018, "TLS_DH_anon_WITH_RC4_128_MD5"),
    legacy(0x001b, "TLS_DH_anon_WITH_3DES_EDE_CBC_SHA"),
    legacy(0x002f, "TLS_RSA_WITH_AES_128_CBC_SHA"),
    legacy(0x0032, "TLS_DHE_DSS_WITH_AES_128_CBC_SHA"),
    legacy(0x0033, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA"),
    legacy(0x0034, "TLS_DH_anon_WITH_AES_128_CBC_SHA"),
    legacy(0x0035, "TLS_RSA_WITH_AES_256_CBC_SHA"),
    legacy(0x0039, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA"),
    legacy(0x003a, "TLS_DH_anon_WITH_AES_256_CBC_SHA"),
    tls12(0x003b, "TLS_RSA_WITH_NULL_SHA256"),
    tls12(0x003c, "TLS_RSA_WITH_AES_128_CBC_SHA256"),
    tls12(0x003d, "TLS_RSA_WITH_AES_256_CBC_SHA256"),
    legacy(0x0041, "TLS_RSA_WITH_CAMELLIA_128_CBC_SHA"),
    legacy(0x0045, "TLS_DHE_RSA_WITH_CAMELLIA_128_CBC_SHA"),
    tls12(0x0067, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA256"),
    tls12(0x006b, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA256"),
    legacy(0x0084, "TLS_RSA_WITH_CAMELLIA_256_CBC_SHA"),
    legacy(0x0088, "TLS_DHE_RSA_WITH_CAMELLIA_256_CBC_SHA"),
    legacy(0x0096, "TLS_RSA_WITH_SEED_CBC_SHA"),
    tls12(0x009c, "TLS_RSA_WITH_AES_128_GCM_SHA256"),
    tls12(0x009d, "TLS_RSA_WITH_AES_256_GCM_SHA384"),
    tls12(0x009e, "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256"),
    tls12(0x009f, "TLS_DHE_RSA_WITH_AES_256_GCM_SHA384"),
    legacy(0xc007, "TLS_ECDHE_ECDSA_WITH_RC4_128_SHA"),
    legacy(0xc008, "TLS_ECDHE_ECDSA_WITH_3DES_EDE_CBC_SHA"),
    legacy(0xc009, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA"),
    legacy(0xc00a, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA"),
    legacy(0xc011, "TLS_ECDHE_RSA_WITH_RC4_128_SHA"),
    legacy(0xc012, "TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA"),
    legacy(0xc013, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA"),
    legacy(0xc014, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA"),
    tls12(0xc023, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256"),
    tls12(0xc024, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384"),
    tls12(0xc027, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256"),
    tls12(0xc028, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384"),
    tls12(0xc02b, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    tls12(0xc02c, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    tls12(0xc02f, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    tls12(0xc030, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    tls12(0xcca8, "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
    tls12(0xcca9, "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    tls12(0xccaa, "TLS_DHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
];

impl CipherSuite {
    pub fn is_tls13(&self) -> bool {
        self.tls13
    }

    pub fn is_ecdhe(&self) -> bool {
        self.name.contains("_ECDHE_")
    }

    /// Suites offering no or broken confidentiality.
    pub fn is_weak(&self) -> bool {
        ["NULL", "EXPORT", "RC4", "_DES_", "DES40", "3DES", "anon", "MD5"]
            .iter()
            .any(|marker| self.name.contains(marker))
    }

    pub fn supports(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::Ssl2 => false,
            ProtocolVersion::Tls13 => self.tls13,
            ProtocolVersion::Tls12 => !self.tls13,
            ProtocolVersion::Ssl3 | ProtocolVersion::Tls10 | ProtocolVersion::Tls11 => {
                !self.tls13 && !self.tls12_only
            }
        }
    }
}

pub fn suites_for(version: ProtocolVersion) -> impl Iterator<Item = &'static CipherSuite> {
    CIPHER_SUITES.iter().filter(move |s| s.supports(version))
}

pub fn suite_ids_for(version: ProtocolVersion) -> Vec<u16> {
    suites_for(version).map(|s| s.id).collect()
}

pub fn by_id(id: u16) -> Option<&'static CipherSuite> {
    CIPHER_SUITES.iter().find(|s| s.id == id)
}

pub fn by_name(name: &str) -> Option<&'static CipherSuite> {
    CIPHER_SUITES.iter().find(|s| s.name == name)
}

/// SSL 2.0 cipher kinds are three bytes wide on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ssl2Cipher {
    pub id: u32,
    pub name: &'static str,
}

pub static SSL2_CIPHERS: &[Ssl2Cipher] = &[
    Ssl2Cipher {
        id: 0x010080,
        name: "SSL_CK_RC4_128_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x020080,
        name: "SSL_CK_RC4_128_EXPORT40_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x030080,
        name: "SSL_CK_RC2_128_CBC_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x040080,
        name: "SSL_CK_RC2_128_CBC_EXPORT40_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x050080,
        name: "SSL_CK_IDEA_128_CBC_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x060040,
        name: "SSL_CK_DES_64_CBC_WITH_MD5",
    },
    Ssl2Cipher {
        id: 0x0700c0,
        name: "SSL_CK_DES_192_EDE3_CBC_WITH_MD5",
    },
];

pub fn ssl2_by_id(id: u32) -> Option<&'static Ssl2Cipher> {
    SSL2_CIPHERS.iter().find(|c| c.id == id)
}

/// Human readable name for any suite code, falling back to hex.
pub fn describe(version: ProtocolVersion, id: u32) -> String {
    let known = if version == ProtocolVersion::Ssl2 {
        ssl2_by_id(id).map(|c| c.name)
    } else {
        u16::try_from(id).ok().and_then(by_id).map(|s| s.name)
    };
    known
        .map(str::to_string)
        .unwrap_or_else(|| format!("UNKNOWN_{:#06x}", id))
}
