use ethers::prelude::abigen;

abigen!(
    LibAddressManager,
    r#"[
        function getAddress(string _name) external view returns (address)
    ]"#
);
