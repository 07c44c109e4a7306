//! Answer file rendering.
//!
//! The answer file only references the staged scripts and payload
//! directories; the scriptlets themselves live in `specialize.ps1` and
//! `firstlogon.ps1`. Rendering is behind [`AnswerFileRenderer`] so a build
//! can swap in its own template.

use anyhow::Result;

use super::WindowsSetupConfig;

/// Answer file placed at the root of the autounattend image.
pub const AUTOUNATTEND_XML: &str = "autounattend.xml";

/// Renders a Windows answer file from a setup config.
pub trait AnswerFileRenderer {
    /// Render the answer file. `sysprep` selects the variant used when a
    /// generalized image boots again, which has no windowsPE pass.
    fn render(&self, config: &WindowsSetupConfig, sysprep: bool) -> Result<String>;
}

/// Built-in answer file for amd64 Windows on a single blank disk.
#[derive(Debug, Default, Clone)]
pub struct UnattendXml;

const COMPONENT_ATTRS: &str = r#"processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35" language="neutral" versionScope="nonSxS" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#;

/// Escape text for use in XML content and attribute values.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

impl UnattendXml {
    fn windows_pe(&self, config: &WindowsSetupConfig) -> String {
        let key = xml_escape(&config.product_key);
        format!(
            r#"  <settings pass="windowsPE">
    <component name="Microsoft-Windows-International-Core-WinPE" {attrs}>
      <SetupUILanguage><UILanguage>en-US</UILanguage></SetupUILanguage>
      <InputLocale>en-US</InputLocale>
      <SystemLocale>en-US</SystemLocale>
      <UILanguage>en-US</UILanguage>
      <UserLocale>en-US</UserLocale>
    </component>
    <component name="Microsoft-Windows-Setup" {attrs}>
      <UserData>
        <ProductKey><Key>{key}</Key><WillShowUI>OnError</WillShowUI></ProductKey>
        <AcceptEula>true</AcceptEula>
      </UserData>
      <DiskConfiguration>
        <Disk wcm:action="add">
          <DiskID>0</DiskID>
          <WillWipeDisk>true</WillWipeDisk>
          <CreatePartitions>
            <CreatePartition wcm:action="add"><Order>1</Order><Type>EFI</Type><Size>300</Size></CreatePartition>
            <CreatePartition wcm:action="add"><Order>2</Order><Type>MSR</Type><Size>16</Size></CreatePartition>
            <CreatePartition wcm:action="add"><Order>3</Order><Type>Primary</Type><Extend>true</Extend></CreatePartition>
          </CreatePartitions>
          <ModifyPartitions>
            <ModifyPartition wcm:action="add"><Order>1</Order><PartitionID>1</PartitionID><Format>FAT32</Format><Label>System</Label></ModifyPartition>
            <ModifyPartition wcm:action="add"><Order>2</Order><PartitionID>3</PartitionID><Format>NTFS</Format><Label>Windows</Label><Letter>C</Letter></ModifyPartition>
          </ModifyPartitions>
        </Disk>
      </DiskConfiguration>
      <ImageInstall>
        <OSImage>
          <InstallTo><DiskID>0</DiskID><PartitionID>3</PartitionID></InstallTo>
        </OSImage>
      </ImageInstall>
    </component>
  </settings>
"#,
            attrs = COMPONENT_ATTRS,
        )
    }

    fn specialize(&self) -> String {
        format!(
            r#"  <settings pass="specialize">
    <component name="Microsoft-Windows-Deployment" {attrs}>
      <RunSynchronous>
        <RunSynchronousCommand wcm:action="add">
          <Order>1</Order>
          <Path>powershell.exe -NoProfile -ExecutionPolicy Bypass -File c:\windows\setup\specialize.ps1</Path>
        </RunSynchronousCommand>
      </RunSynchronous>
    </component>
  </settings>
"#,
            attrs = COMPONENT_ATTRS,
        )
    }

    fn oobe_system(&self, config: &WindowsSetupConfig) -> String {
        let password = xml_escape(&config.admin_password);
        format!(
            r#"  <settings pass="oobeSystem">
    <component name="Microsoft-Windows-Shell-Setup" {attrs}>
      <OOBE>
        <HideEULAPage>true</HideEULAPage>
        <HideOnlineAccountScreens>true</HideOnlineAccountScreens>
        <HideWirelessSetupInOOBE>true</HideWirelessSetupInOOBE>
        <ProtectYourPC>3</ProtectYourPC>
      </OOBE>
      <UserAccounts>
        <AdministratorPassword><Value>{password}</Value><PlainText>true</PlainText></AdministratorPassword>
        <LocalAccounts>
          <LocalAccount wcm:action="add">
            <Name>admin</Name>
            <Group>Administrators</Group>
            <Password><Value>{password}</Value><PlainText>true</PlainText></Password>
          </LocalAccount>
        </LocalAccounts>
      </UserAccounts>
      <AutoLogon>
        <Enabled>true</Enabled>
        <LogonCount>1</LogonCount>
        <Username>admin</Username>
        <Password><Value>{password}</Value><PlainText>true</PlainText></Password>
      </AutoLogon>
      <FirstLogonCommands>
        <SynchronousCommand wcm:action="add">
          <Order>1</Order>
          <CommandLine>powershell.exe -NoProfile -ExecutionPolicy Bypass -File c:\windows\setup\firstlogon.ps1</CommandLine>
        </SynchronousCommand>
      </FirstLogonCommands>
    </component>
  </settings>
"#,
            attrs = COMPONENT_ATTRS,
        )
    }
}

impl AnswerFileRenderer for UnattendXml {
    fn render(&self, config: &WindowsSetupConfig, sysprep: bool) -> Result<String> {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <unattend xmlns=\"urn:schemas-microsoft-com:unattend\">\n",
        );
        if !sysprep {
            xml.push_str(&self.windows_pe(config));
        }
        xml.push_str(&self.specialize());
        xml.push_str(&self.oobe_system(config));
        xml.push_str("</unattend>\n");
        Ok(xml)
    }
}
